//! Metadata information regarding mapped entities and their members.

use std::collections::BTreeSet;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::database::{DbType, ScalarType};
use super::MetadataError;

/// Identifies a mapped entity.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct EntityId(pub SmolStr);

impl EntityId {
    pub fn new(name: &str) -> Self {
        EntityId(SmolStr::new(name))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The mapping of one entity type onto one or more tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappedEntity {
    pub entity_id: EntityId,
    pub type_name: String,
    /// The type actually constructed, when it differs from `type_name`.
    #[serde(default)]
    pub constructed_type: Option<String>,
    pub primary_table: String,
    /// Tables holding further columns of the same entity, joined by key columns.
    #[serde(default)]
    pub extension_tables: Vec<ExtensionTable>,
    pub primary_key_members: Vec<String>,
    pub members: Vec<MappedMember>,
    #[serde(default)]
    pub constructors: Vec<Constructor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionTable {
    pub name: String,
    /// The table this one extends; the primary table when absent.
    #[serde(default)]
    pub related_table: Option<String>,
    pub key_columns: Vec<KeyColumnPair>,
}

impl ExtensionTable {
    pub fn related_table<'a>(&'a self, primary_table: &'a str) -> &'a str {
        self.related_table.as_deref().unwrap_or(primary_table)
    }
}

/// A column of an extension table and the column of the related table it equals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyColumnPair {
    pub column: String,
    pub related_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappedMember {
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(flatten)]
    pub mapping: MemberMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MemberMapping {
    Column(ColumnMapping),
    Association(AssociationMapping),
    Nested(NestedMapping),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    /// The table holding the column; the primary table when absent.
    #[serde(default)]
    pub table: Option<String>,
    pub column: String,
    pub db_type: String,
    #[serde(default)]
    pub generated: bool,
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnMapping {
    pub fn parsed_type(&self) -> Result<DbType, MetadataError> {
        DbType::parse(&self.db_type)
    }

    pub fn scalar_type(&self) -> Result<ScalarType, MetadataError> {
        Ok(self.parsed_type()?.scalar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssociationMapping {
    pub key_members: Vec<String>,
    pub related_entity: EntityId,
    pub related_key_members: Vec<String>,
    /// Whether the key members of this side hold the foreign key.
    #[serde(default)]
    pub foreign_key: bool,
    pub cardinality: Cardinality,
}

/// An inline sub-object whose members live in the columns of the owning entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NestedMapping {
    pub type_name: String,
    pub members: Vec<MappedMember>,
    #[serde(default)]
    pub constructors: Vec<Constructor>,
}

/// A constructor of the mapped type, with its parameters in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Constructor {
    pub parameters: Vec<ConstructorParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConstructorParameter {
    pub name: String,
    /// The member this parameter initialises, when it is not implied by the name.
    #[serde(default)]
    pub member: Option<String>,
}

impl MappedEntity {
    pub fn member(&self, name: &str) -> Option<&MappedMember> {
        self.members.iter().find(|member| member.name == name)
    }

    pub fn lookup_member(&self, name: &str) -> Result<&MappedMember, MetadataError> {
        self.member(name).ok_or_else(|| MetadataError::MemberNotFound {
            entity: self.entity_id.clone(),
            member: name.to_string(),
        })
    }

    /// The type name of constructed instances.
    pub fn runtime_type(&self) -> &str {
        self.constructed_type.as_deref().unwrap_or(&self.type_name)
    }

    pub fn is_primary_key(&self, member: &str) -> bool {
        self.primary_key_members.iter().any(|key| key == member)
    }

    /// The table holding a column member.
    pub fn table_of<'a>(&'a self, column: &'a ColumnMapping) -> &'a str {
        column.table.as_deref().unwrap_or(&self.primary_table)
    }

    pub fn extension_table(&self, name: &str) -> Option<&ExtensionTable> {
        self.extension_tables.iter().find(|table| table.name == name)
    }

    /// Column members in declared order, including the columns of nested members.
    pub fn column_members(&self) -> Vec<(&MappedMember, &ColumnMapping)> {
        fn collect<'a>(
            members: &'a [MappedMember],
            into: &mut Vec<(&'a MappedMember, &'a ColumnMapping)>,
        ) {
            for member in members {
                match &member.mapping {
                    MemberMapping::Column(column) => into.push((member, column)),
                    MemberMapping::Nested(nested) => collect(&nested.members, into),
                    MemberMapping::Association(_) => {}
                }
            }
        }
        let mut columns = vec![];
        collect(&self.members, &mut columns);
        columns
    }

    /// Find the column member mapped to a given table column.
    pub fn member_for_column(&self, table: &str, column: &str) -> Option<&MappedMember> {
        self.column_members()
            .into_iter()
            .find(|(_, mapping)| self.table_of(mapping) == table && mapping.column == column)
            .map(|(member, _)| member)
    }

    /// Tables in dependency order: a table always follows the table it extends.
    pub fn dependency_ordered_tables(&self) -> Result<Vec<&str>, MetadataError> {
        let mut ordered: Vec<&str> = vec![self.primary_table.as_str()];
        let mut placed: BTreeSet<&str> = BTreeSet::from([self.primary_table.as_str()]);
        let mut pending: Vec<&ExtensionTable> = self.extension_tables.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|&table| {
                if placed.contains(table.related_table(&self.primary_table)) {
                    ordered.push(table.name.as_str());
                    placed.insert(table.name.as_str());
                    false
                } else {
                    true
                }
            });
            if pending.len() == before {
                return Err(MetadataError::TableNotFound {
                    entity: self.entity_id.clone(),
                    table: pending[0].related_table(&self.primary_table).to_string(),
                });
            }
        }

        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, table: Option<&str>, db_type: &str) -> MappedMember {
        MappedMember {
            name: name.to_string(),
            read_only: false,
            mapping: MemberMapping::Column(ColumnMapping {
                table: table.map(ToString::to_string),
                column: name.to_string(),
                db_type: db_type.to_string(),
                generated: false,
                computed: false,
                primary_key: false,
            }),
        }
    }

    fn extension(name: &str, related: Option<&str>) -> ExtensionTable {
        ExtensionTable {
            name: name.to_string(),
            related_table: related.map(ToString::to_string),
            key_columns: vec![KeyColumnPair {
                column: "Id".to_string(),
                related_column: "Id".to_string(),
            }],
        }
    }

    fn person(extension_tables: Vec<ExtensionTable>) -> MappedEntity {
        MappedEntity {
            entity_id: EntityId::new("Person"),
            type_name: "Person".to_string(),
            constructed_type: None,
            primary_table: "Person".to_string(),
            extension_tables,
            primary_key_members: vec!["Id".to_string()],
            members: vec![
                column("Id", None, "int NOT NULL"),
                column("Bio", Some("PersonDetail"), "text"),
            ],
            constructors: vec![],
        }
    }

    #[test]
    fn extension_tables_follow_what_they_extend() {
        let entity = person(vec![
            extension("PersonPhoto", Some("PersonDetail")),
            extension("PersonDetail", None),
        ]);
        assert_eq!(
            entity.dependency_ordered_tables().unwrap(),
            vec!["Person", "PersonDetail", "PersonPhoto"]
        );
    }

    #[test]
    fn unknown_related_table_is_reported() {
        let entity = person(vec![extension("PersonPhoto", Some("Nowhere"))]);
        assert_eq!(
            entity.dependency_ordered_tables(),
            Err(MetadataError::TableNotFound {
                entity: EntityId::new("Person"),
                table: "Nowhere".to_string()
            })
        );
    }

    #[test]
    fn member_for_column_respects_tables() {
        let entity = person(vec![extension("PersonDetail", None)]);
        assert_eq!(
            entity.member_for_column("PersonDetail", "Bio").map(|m| m.name.as_str()),
            Some("Bio")
        );
        assert!(entity.member_for_column("Person", "Bio").is_none());
    }

    #[test]
    fn members_deserialize_with_a_kind_tag() {
        let member: MappedMember = serde_json::from_value(serde_json::json!({
            "name": "Orders",
            "kind": "association",
            "keyMembers": ["Id"],
            "relatedEntity": "Order",
            "relatedKeyMembers": ["CustomerId"],
            "cardinality": "many"
        }))
        .unwrap();
        match member.mapping {
            MemberMapping::Association(association) => {
                assert_eq!(association.related_entity, EntityId::new("Order"));
                assert_eq!(association.cardinality, Cardinality::Many);
                assert!(!association.foreign_key);
            }
            other => panic!("unexpected mapping {other:?}"),
        }
    }
}
