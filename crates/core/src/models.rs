use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One image in the dataset. `id` is its position in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: usize,
    pub filepath: PathBuf,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    samples: Vec<Sample>,
}

impl Dataset {
    /// Empty dataset with a fresh random name.
    pub fn new() -> Self {
        Self::named(uuid::Uuid::new_v4().to_string())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            samples: Vec::new(),
        }
    }

    pub fn add_sample(&mut self, filepath: PathBuf, tag: &str) -> &Sample {
        let id = self.samples.len();
        self.samples.push(Sample {
            id,
            filepath,
            tags: vec![tag.to_string()],
        });
        &self.samples[id]
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn get(&self, id: usize) -> Option<&Sample> {
        self.samples.get(id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for Dataset {
    fn default() -> Self {
        Self::new()
    }
}
