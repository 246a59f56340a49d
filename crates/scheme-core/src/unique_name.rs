//! File-name generation for schemes.

use std::collections::HashSet;

/// Characters that cannot appear in a file name on at least one platform.
const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Turn a scheme key into something usable as a file stem.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| if RESERVED.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        // "", "." and ".." cannot name a file
        format!("_{}", sanitized)
    } else {
        sanitized
    }
}

/// Generates names unique against a growing set of names in use.
///
/// Comparison ignores case so that two schemes never map to the same file on
/// a case-insensitive filesystem.
#[derive(Debug, Default)]
pub struct UniqueNameGenerator {
    existing: HashSet<String>,
}

impl UniqueNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a name that is already taken.
    pub fn add_existing_name(&mut self, name: &str) {
        self.existing.insert(name.to_lowercase());
    }

    /// Whether `name` has not been reserved or generated yet.
    pub fn is_unique(&self, name: &str) -> bool {
        !self.existing.contains(&name.to_lowercase())
    }

    /// `name` if free, otherwise `name2`, `name3`, ... The result is reserved.
    pub fn generate_unique_name(&mut self, name: &str) -> String {
        let mut candidate = name.to_string();
        let mut counter = 2;
        while !self.is_unique(&candidate) {
            candidate = format!("{}{}", name, counter);
            counter += 1;
        }
        self.add_existing_name(&candidate);
        candidate
    }
}
