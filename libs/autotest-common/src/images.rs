use crate::error::ConfigError;
use crate::types::{stringify, CaseDescriptor, ID_SEPARATOR};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// A single entry of the `images` document.
///
/// Two spellings are accepted:
/// - `"<image>": {"DIST": "alma9", ...}` selects by attribute subset
/// - `"<selector>": "<image>"` selects by identity tokens, e.g. `"alma9-py3.9"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageEntry {
    Reference(String),
    Attributes(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
enum Selector {
    Attributes(BTreeMap<String, String>),
    Label(Vec<String>),
}

impl Selector {
    fn matches(&self, case: &CaseDescriptor) -> bool {
        match self {
            Selector::Attributes(wanted) => wanted
                .iter()
                .all(|(key, value)| case.env().get(key) == Some(value)),
            Selector::Label(tokens) => {
                let parts = case.id_parts();
                tokens.iter().all(|token| parts.contains(token))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ImageRule {
    image: String,
    selector: Selector,
}

/// Maps case attribute sets to concrete image references
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "BTreeMap<String, ImageEntry>")]
pub struct ImageTable {
    rules: Vec<ImageRule>,
}

impl From<BTreeMap<String, ImageEntry>> for ImageTable {
    fn from(entries: BTreeMap<String, ImageEntry>) -> Self {
        let rules = entries
            .into_iter()
            .map(|(key, entry)| match entry {
                ImageEntry::Attributes(attrs) => ImageRule {
                    image: key,
                    selector: Selector::Attributes(
                        attrs.iter().map(|(k, v)| (k.clone(), stringify(v))).collect(),
                    ),
                },
                ImageEntry::Reference(image) => ImageRule {
                    image,
                    selector: Selector::Label(
                        key.split(ID_SEPARATOR)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect(),
                    ),
                },
            })
            .collect();
        Self { rules }
    }
}

impl ImageTable {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve the image for a case. Exactly one rule must match.
    pub fn find_image(&self, case: &CaseDescriptor) -> Result<&str, ConfigError> {
        let mut matched = self.rules.iter().filter(|rule| rule.selector.matches(case));

        let first = matched.next().ok_or_else(|| ConfigError::NoImage {
            case_id: case.case_id(),
        })?;

        let rest: Vec<&ImageRule> = matched.collect();
        if !rest.is_empty() {
            let mut images = vec![first.image.clone()];
            images.extend(rest.iter().map(|r| r.image.clone()));
            return Err(ConfigError::AmbiguousImage {
                case_id: case.case_id(),
                images,
            });
        }

        Ok(&first.image)
    }
}
