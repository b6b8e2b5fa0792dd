//! Folder config module.
//!
//! This module contains the folder classification patterns and the
//! per-destination-folder flag policy.

use regex::Regex;
use serde::Deserialize;
use std::{collections::HashMap, result};
use thiserror::Error;

use crate::email::Flags;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot compile folder pattern {1}")]
    CompilePatternError(#[source] regex::Error, String),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the folder patterns and flag policies.
///
/// Patterns are glob-style: `*` matches anything, `.` and `/` both
/// stand for the server's hierarchy delimiter, and the doubled forms
/// `..`, `//` and `**` stand for the literal character.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FoldersConfig {
    /// Represents the folders excluded from processing.
    pub ignore: Option<Vec<String>>,
    /// Represents the folders holding junk messages.
    pub junk: Option<Vec<String>>,
    /// Represents the folders used as training corpus.
    pub corpus: Option<Vec<String>>,
    /// Represents the flag policy: keys are `+Flag` (force-add) or
    /// `-Flag` (force-remove), values the destination folders the
    /// policy applies to, `*` meaning every folder.
    pub flags: Option<HashMap<String, Vec<String>>>,
}

impl FoldersConfig {
    pub fn ignore_patterns(&self, delim: &str) -> Result<Vec<FolderPattern>> {
        compile_patterns(self.ignore.as_deref().unwrap_or_default(), delim)
    }

    pub fn junk_patterns(&self, delim: &str) -> Result<Vec<FolderPattern>> {
        compile_patterns(self.junk.as_deref().unwrap_or_default(), delim)
    }

    pub fn corpus_patterns(&self, delim: &str) -> Result<Vec<FolderPattern>> {
        compile_patterns(self.corpus.as_deref().unwrap_or_default(), delim)
    }

    /// Collects the flags forced on messages replicated into the given
    /// destination folder.
    pub fn flags_add(&self, folder: &str) -> Flags {
        self.policy_flags('+', folder)
    }

    /// Collects the flags stripped from messages replicated into the
    /// given destination folder.
    pub fn flags_remove(&self, folder: &str) -> Flags {
        self.policy_flags('-', folder)
    }

    fn policy_flags(&self, sign: char, folder: &str) -> Flags {
        let mut flags = Flags::default();
        for (key, folders) in self.flags.iter().flatten() {
            let flag = match key.strip_prefix(sign) {
                Some(flag) if !flag.is_empty() => flag,
                _ => continue,
            };
            if folders.iter().any(|f| f == folder || f == "*") {
                flags.insert(flag.into());
            }
        }
        flags
    }
}

fn compile_patterns(patterns: &[String], delim: &str) -> Result<Vec<FolderPattern>> {
    patterns
        .iter()
        .map(|pattern| FolderPattern::compile(pattern, delim))
        .collect()
}

/// Represents one compiled folder pattern.
#[derive(Debug, Clone)]
pub struct FolderPattern(Regex);

impl FolderPattern {
    pub fn compile(pattern: &str, delim: &str) -> Result<Self> {
        // Strip backslash escapes first, then append a sentinel so the
        // two-character window below also flushes the last character.
        let mut unescaped = String::with_capacity(pattern.len() + 1);
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        unescaped.push(next);
                    }
                }
                c => unescaped.push(c),
            }
        }
        unescaped.push('\0');

        let mut regex = String::from(r"\A");
        let mut window: Vec<char> = Vec::with_capacity(2);
        for c in unescaped.chars() {
            window.push(c);
            if window.len() < 2 {
                continue;
            }
            match (window[0], window[1]) {
                // Doubled special characters match themselves.
                ('.', '.') | ('/', '/') | ('*', '*') => {
                    window.remove(0);
                    let literal = window.remove(0);
                    regex.push_str(&regex::escape(&literal.to_string()));
                }
                // A single dot or slash stands for the hierarchy
                // delimiter, whatever it is on this server.
                ('.', _) | ('/', _) => {
                    window.remove(0);
                    regex.push_str(&regex::escape(delim));
                }
                ('*', _) => {
                    window.remove(0);
                    regex.push_str(".*");
                }
                (c, _) => {
                    window.remove(0);
                    regex.push_str(&regex::escape(&c.to_string()));
                }
            }
        }
        regex.push_str(r"\z");

        Regex::new(&regex)
            .map(Self)
            .map_err(|err| Error::CompilePatternError(err, pattern.to_owned()))
    }

    pub fn matches(&self, folder: &str) -> bool {
        self.0.is_match(folder)
    }
}

pub fn matches_any(patterns: &[FolderPattern], folder: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(folder))
}
