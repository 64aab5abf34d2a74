//! Helpers for processing requests and building SQL.

use query_engine_metadata::metadata::{EntityId, MappedEntity, MappedMember, Metadata};
use query_engine_sql::sql::ast::{AliasGenerator, TableAlias};
use query_engine_sql::sql::dialect::Dialect;

use super::error::Error;
use super::policy::Policy;

/// Static information from the configuration, shared by every stage of a translation.
#[derive(Debug, Clone, Copy)]
pub struct Env<'a> {
    pub metadata: &'a Metadata,
    pub policy: &'a Policy,
    pub dialect: &'a dyn Dialect,
}

/// Stateful information changed throughout one translation.
#[derive(Debug, Default)]
pub struct State {
    aliases: AliasGenerator,
}

impl<'a> Env<'a> {
    pub fn new(metadata: &'a Metadata, policy: &'a Policy, dialect: &'a dyn Dialect) -> Self {
        Env {
            metadata,
            policy,
            dialect,
        }
    }

    /// Lookup an entity in the metadata.
    pub fn lookup_entity(&self, entity_id: &EntityId) -> Result<&'a MappedEntity, Error> {
        Ok(self.metadata.lookup_entity(entity_id)?)
    }

    /// Lookup a member of an entity.
    pub fn lookup_member(
        &self,
        entity_id: &EntityId,
        member: &str,
    ) -> Result<&'a MappedMember, Error> {
        Ok(self.lookup_entity(entity_id)?.lookup_member(member)?)
    }

    /// The entity whose instances have the given type name, if it is mapped.
    pub fn entity_of_type(&self, type_name: &str) -> Option<&'a MappedEntity> {
        self.metadata
            .entities
            .values()
            .find(|entity| entity.type_name == type_name || entity.runtime_type() == type_name)
    }
}

impl State {
    pub fn new() -> State {
        State {
            aliases: AliasGenerator::new(),
        }
    }

    /// Mint a fresh table alias.
    pub fn next_alias(&mut self) -> TableAlias {
        self.aliases.next_alias()
    }
}
