//! Well-known objects discoverable without an interest.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::channel::DoId;
use crate::dclass::{ClassRegistry, DcClass};

/// A well-known object with a fixed id.
///
/// Anonymous uberdogs additionally accept field updates from clients that
/// have not yet been authenticated.
#[derive(Debug, Clone)]
pub struct Uberdog {
    pub class: Arc<DcClass>,
    pub anonymous: bool,
}

/// Configuration entry for one uberdog.
#[derive(Debug, Clone, Deserialize)]
pub struct UberdogConfig {
    pub id: DoId,
    pub class: String,
    #[serde(default)]
    pub anonymous: bool,
}

/// Errors raised while building the uberdog registry.
#[derive(Debug, Clone, Error)]
pub enum UberdogError {
    #[error("uberdog {id} references unknown class {class}")]
    UnknownClass { id: DoId, class: String },

    #[error("duplicate uberdog id {0}")]
    DuplicateId(DoId),
}

/// Process-wide map of uberdog ids, populated once at role startup and
/// shared read-only afterwards.
#[derive(Debug, Default)]
pub struct UberdogRegistry {
    dogs: HashMap<DoId, Uberdog>,
}

impl UberdogRegistry {
    /// Resolves config entries against the class registry.
    pub fn from_config(
        classes: &ClassRegistry,
        entries: &[UberdogConfig],
    ) -> Result<Self, UberdogError> {
        let mut dogs = HashMap::with_capacity(entries.len());
        for entry in entries {
            let class = classes.get_class_by_name(&entry.class).ok_or_else(|| {
                UberdogError::UnknownClass {
                    id: entry.id,
                    class: entry.class.clone(),
                }
            })?;
            let prev = dogs.insert(
                entry.id,
                Uberdog {
                    class,
                    anonymous: entry.anonymous,
                },
            );
            if prev.is_some() {
                return Err(UberdogError::DuplicateId(entry.id));
            }
        }
        Ok(Self { dogs })
    }

    pub fn get(&self, do_id: DoId) -> Option<&Uberdog> {
        self.dogs.get(&do_id)
    }

    /// Whether the id names an uberdog that accepts pre-auth updates.
    pub fn is_anonymous(&self, do_id: DoId) -> bool {
        self.dogs.get(&do_id).is_some_and(|d| d.anonymous)
    }

    pub fn len(&self) -> usize {
        self.dogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dogs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dclass::ClassConfig;

    fn classes() -> ClassRegistry {
        ClassRegistry::from_config(&[
            ClassConfig {
                name: "LoginManager".to_string(),
                fields: Vec::new(),
            },
            ClassConfig {
                name: "ChatManager".to_string(),
                fields: Vec::new(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_from_config_resolves_classes() {
        let reg = UberdogRegistry::from_config(
            &classes(),
            &[
                UberdogConfig {
                    id: 100,
                    class: "LoginManager".to_string(),
                    anonymous: true,
                },
                UberdogConfig {
                    id: 101,
                    class: "ChatManager".to_string(),
                    anonymous: false,
                },
            ],
        )
        .unwrap();

        assert_eq!(reg.len(), 2);
        assert!(reg.is_anonymous(100));
        assert!(!reg.is_anonymous(101));
        assert!(!reg.is_anonymous(999));
        assert_eq!(reg.get(101).unwrap().class.name(), "ChatManager");
    }

    #[test]
    fn test_unknown_class_is_fatal() {
        let err = UberdogRegistry::from_config(
            &classes(),
            &[UberdogConfig {
                id: 100,
                class: "TimeManager".to_string(),
                anonymous: false,
            }],
        )
        .unwrap_err();
        assert!(matches!(err, UberdogError::UnknownClass { id: 100, .. }));
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let err = UberdogRegistry::from_config(
            &classes(),
            &[
                UberdogConfig {
                    id: 100,
                    class: "LoginManager".to_string(),
                    anonymous: false,
                },
                UberdogConfig {
                    id: 100,
                    class: "ChatManager".to_string(),
                    anonymous: false,
                },
            ],
        )
        .unwrap_err();
        assert!(matches!(err, UberdogError::DuplicateId(100)));
    }
}
