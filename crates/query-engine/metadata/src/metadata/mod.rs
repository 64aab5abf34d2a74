//! Metadata information regarding mapped entities and the tables backing them.

pub mod database;
pub mod mapping;

// re-export without modules
pub use database::*;
pub use mapping::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata information.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct Metadata {
    pub entities: BTreeMap<EntityId, MappedEntity>,
}

impl Metadata {
    pub fn empty() -> Self {
        Metadata {
            entities: BTreeMap::new(),
        }
    }

    /// Build metadata from a list of entities, keyed by their entity id.
    pub fn from_entities(entities: impl IntoIterator<Item = MappedEntity>) -> Self {
        Metadata {
            entities: entities
                .into_iter()
                .map(|entity| (entity.entity_id.clone(), entity))
                .collect(),
        }
    }

    /// Lookup an entity by its id.
    pub fn lookup_entity(&self, entity_id: &EntityId) -> Result<&MappedEntity, MetadataError> {
        self.entities
            .get(entity_id)
            .ok_or_else(|| MetadataError::EntityNotFound(entity_id.clone()))
    }

    /// Check that every association points at a known entity and that keys line up.
    pub fn validate(&self) -> Result<(), MetadataError> {
        for entity in self.entities.values() {
            for key in &entity.primary_key_members {
                if entity.member(key).is_none() {
                    return Err(MetadataError::MemberNotFound {
                        entity: entity.entity_id.clone(),
                        member: key.clone(),
                    });
                }
            }
            for extension in &entity.extension_tables {
                let related = extension.related_table(&entity.primary_table);
                if related != entity.primary_table && entity.extension_table(related).is_none() {
                    return Err(MetadataError::TableNotFound {
                        entity: entity.entity_id.clone(),
                        table: related.to_string(),
                    });
                }
            }
            for member in &entity.members {
                if let MemberMapping::Association(association) = &member.mapping {
                    let related = self.lookup_entity(&association.related_entity)?;
                    if association.key_members.len() != association.related_key_members.len() {
                        return Err(MetadataError::MismatchedAssociationKeys {
                            entity: entity.entity_id.clone(),
                            member: member.name.clone(),
                        });
                    }
                    for key in &association.related_key_members {
                        if related.member(key).is_none() {
                            return Err(MetadataError::MemberNotFound {
                                entity: related.entity_id.clone(),
                                member: key.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Problems found while looking up or validating metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("entity '{0}' not found")]
    EntityNotFound(EntityId),
    #[error("member '{member}' not found on entity '{entity}'")]
    MemberNotFound { entity: EntityId, member: String },
    #[error("table '{table}' referenced by entity '{entity}' is not mapped")]
    TableNotFound { entity: EntityId, table: String },
    #[error("association '{member}' of entity '{entity}' has mismatched key member lists")]
    MismatchedAssociationKeys { entity: EntityId, member: String },
    #[error("cannot parse database type '{0}'")]
    InvalidDbType(String),
}
