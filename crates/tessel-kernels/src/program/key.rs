use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::hash::{Hash, Hasher};

use crate::shape::TensorShape;

/// Accumulates the structural parameters of a program into its cache key.
///
/// Only shapes and static parameters go in; tensor and uniform values never do.
#[derive(Clone, Debug)]
pub struct KeyBuilder {
    parts: Vec<String>,
}

impl KeyBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            parts: vec![name.to_string()],
        }
    }

    pub fn push(mut self, label: &str, value: impl Display) -> Self {
        self.parts.push(format!("{label}={value}"));
        self
    }

    pub fn shape(self, label: &str, shape: &TensorShape) -> Self {
        self.push(label, shape)
    }

    pub fn list<T: Display>(self, label: &str, values: &[T]) -> Self {
        let joined = values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.push(label, joined)
    }

    pub fn finish(self) -> String {
        self.parts.join("|")
    }
}

/// 64-bit digest of a cache key for hash-keyed registries and file names.
pub fn program_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
