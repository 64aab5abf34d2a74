//! Mapping fixtures for a small sales database.

use query_engine_execution::{build_plan, QueryPlan};
use query_engine_metadata::metadata::{
    AssociationMapping, Cardinality, ColumnMapping, EntityId, ExtensionTable, KeyColumnPair,
    MappedEntity, MappedMember, MemberMapping, Metadata,
};
use query_engine_sql::sql::ast::ExprRef;
use query_engine_sql::sql::dialect::Dialect;
use query_engine_translation::translation::helpers::Env;
use query_engine_translation::translation::policy::Policy;

pub fn column(name: &str, db_type: &str) -> MappedMember {
    MappedMember {
        name: name.to_string(),
        read_only: false,
        mapping: MemberMapping::Column(ColumnMapping {
            table: None,
            column: name.to_string(),
            db_type: db_type.to_string(),
            generated: false,
            computed: false,
            primary_key: name == "Id",
        }),
    }
}

/// A key column whose values the database assigns on insert.
pub fn generated_key(name: &str) -> MappedMember {
    let mut member = column(name, "int NOT NULL");
    if let MemberMapping::Column(mapping) = &mut member.mapping {
        mapping.generated = true;
    }
    member
}

/// A column stored in the extension table `table`.
pub fn extension_column(table: &str, name: &str, db_type: &str) -> MappedMember {
    let mut member = column(name, db_type);
    if let MemberMapping::Column(mapping) = &mut member.mapping {
        mapping.table = Some(table.to_string());
    }
    member
}

pub fn association(
    name: &str,
    related: &str,
    key: &str,
    related_key: &str,
    cardinality: Cardinality,
    foreign_key: bool,
) -> MappedMember {
    MappedMember {
        name: name.to_string(),
        read_only: false,
        mapping: MemberMapping::Association(AssociationMapping {
            key_members: vec![key.to_string()],
            related_entity: EntityId::new(related),
            related_key_members: vec![related_key.to_string()],
            foreign_key,
            cardinality,
        }),
    }
}

pub fn entity(name: &str, table: &str, members: Vec<MappedMember>) -> MappedEntity {
    MappedEntity {
        entity_id: EntityId::new(name),
        type_name: name.to_string(),
        constructed_type: None,
        primary_table: table.to_string(),
        extension_tables: vec![],
        primary_key_members: vec!["Id".to_string()],
        members,
        constructors: vec![],
    }
}

/// Customers with their orders, parents with at most one child each, and people
/// whose details live in a second table.
pub fn sales() -> Metadata {
    let mut person = entity(
        "Person",
        "People",
        vec![
            generated_key("Id"),
            column("Name", "nvarchar(60)"),
            extension_column("PersonDetails", "Bio", "nvarchar(400)"),
        ],
    );
    person.extension_tables.push(ExtensionTable {
        name: "PersonDetails".to_string(),
        related_table: None,
        key_columns: vec![KeyColumnPair {
            column: "PersonId".to_string(),
            related_column: "Id".to_string(),
        }],
    });

    Metadata::from_entities([
        entity(
            "Customer",
            "Customers",
            vec![
                column("Id", "int NOT NULL"),
                column("Name", "nvarchar(40)"),
                column("City", "nvarchar(30)"),
                association("Orders", "Order", "Id", "CustomerId", Cardinality::Many, false),
            ],
        ),
        entity(
            "Order",
            "Orders",
            vec![
                generated_key("Id"),
                column("CustomerId", "int NOT NULL"),
                column("Total", "decimal(10,2)"),
                association("Customer", "Customer", "CustomerId", "Id", Cardinality::One, true),
            ],
        ),
        entity(
            "Parent",
            "Parents",
            vec![
                column("Id", "int NOT NULL"),
                column("Name", "nvarchar(40)"),
                association("Child", "Child", "Id", "ParentId", Cardinality::One, false),
            ],
        ),
        entity(
            "Child",
            "Children",
            vec![
                column("Id", "int NOT NULL"),
                column("ParentId", "int NOT NULL"),
                column("Name", "nvarchar(40)"),
            ],
        ),
        person,
    ])
}

/// Translate and plan `query` against the sales mapping.
pub fn plan(query: &ExprRef, policy: &Policy, dialect: &dyn Dialect) -> QueryPlan {
    let metadata = sales();
    let env = Env::new(&metadata, policy, dialect);
    build_plan(&env, query)
}

/// A policy eagerly loading each include path listed, such as `Customer.Orders`.
pub fn including(paths: &[&str]) -> anyhow::Result<Policy> {
    let metadata = sales();
    let mut policy = Policy::new();
    for path in paths {
        policy.include_path(&metadata, path, false)?;
    }
    Ok(policy)
}
