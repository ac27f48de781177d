//! Framework selector used to narrow a manifest to one weights format.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::hub::ManifestEntry;

/// Files kept by every framework filter.
pub const ALWAYS_KEEP: &[&str] = &[
    "config.json",
    "modules.json",
    "sentence_bert_config.json",
    "config_sentence_transformers.json",
    "tokenizer_config.json",
    "tokenizer.json",
    "special_tokens_map.json",
    "vocab.txt",
    "merges.txt",
];

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Pytorch,
    Tensorflow,
    Tensorflow1,
    Flax,
}

impl Framework {
    /// Canonical weights filename of the framework.
    #[must_use]
    pub const fn weights_filename(self) -> &'static str {
        match self {
            Self::Pytorch => "pytorch_model.bin",
            Self::Tensorflow => "tf_model.h5",
            Self::Tensorflow1 => "model.ckpt",
            Self::Flax => "flax_model.msgpack",
        }
    }

    /// Whether a manifest path survives this framework's filter.
    #[must_use]
    pub fn keeps(self, relative_path: &str) -> bool {
        relative_path == self.weights_filename() || ALWAYS_KEEP.contains(&relative_path)
    }
}

/// Drop entries the framework does not need; keep everything when unset.
///
/// Manifest order is preserved.
#[must_use]
pub fn filter_manifest(
    entries: Vec<ManifestEntry>,
    framework: Option<Framework>,
) -> Vec<ManifestEntry> {
    match framework {
        None => entries,
        Some(framework) => entries
            .into_iter()
            .filter(|entry| framework.keeps(entry.as_str()))
            .collect(),
    }
}
