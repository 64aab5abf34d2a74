use query_engine_metadata::metadata::{
    AssociationMapping, Cardinality, ColumnMapping, EntityId, MappedEntity, MappedMember,
    MemberMapping, Metadata,
};
use query_engine_sql::sql;
use query_engine_sql::sql::ast::ExprRef;
use query_engine_sql::sql::dialect::Dialect;
use query_engine_translation::translation;
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

fn association(
    name: &str,
    related: &str,
    key: &str,
    related_key: &str,
    cardinality: Cardinality,
) -> MappedMember {
    MappedMember {
        name: name.to_string(),
        read_only: false,
        mapping: MemberMapping::Association(AssociationMapping {
            key_members: vec![key.to_string()],
            related_entity: EntityId::new(related),
            related_key_members: vec![related_key.to_string()],
            foreign_key: cardinality == Cardinality::One,
            cardinality,
        }),
    }
}

fn entity(name: &str, table: &str, members: Vec<MappedMember>) -> MappedEntity {
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

/// Customers and their orders; order ids are generated by the database.
pub fn metadata() -> Metadata {
    let mut order_id = column("Id", "int NOT NULL");
    if let MemberMapping::Column(mapping) = &mut order_id.mapping {
        mapping.generated = true;
    }
    Metadata::from_entities([
        entity(
            "Customer",
            "Customers",
            vec![
                column("Id", "int NOT NULL"),
                column("Name", "nvarchar(40)"),
                column("City", "nvarchar(30)"),
                association("Orders", "Order", "Id", "CustomerId", Cardinality::Many),
            ],
        ),
        entity(
            "Order",
            "Orders",
            vec![
                order_id,
                column("CustomerId", "int NOT NULL"),
                column("Total", "decimal(10,2)"),
                association("Customer", "Customer", "CustomerId", "Id", Cardinality::One),
            ],
        ),
    ])
}

/// Translate `query` and format its top-level statement.
pub fn translate_sql(
    query: &ExprRef,
    dialect: &dyn Dialect,
    policy: &Policy,
) -> anyhow::Result<(String, Vec<sql::string::QueryParameter>, usize)> {
    let metadata = metadata();
    let env = Env::new(&metadata, policy, dialect);
    let translated = translation::translate(&env, query)?;
    let parameterized = translation::parameterize::parameterize(&translated.expression);
    let formatted = sql::convert::format(&parameterized, dialect);
    let diagnostics = translated.diagnostics.len() + formatted.diagnostics.len();
    Ok((formatted.command.text, formatted.command.parameters, diagnostics))
}

/// `translate_sql`, pretty-printed with the parameters listed below the text.
pub fn pretty_sql(query: &ExprRef, dialect: &dyn Dialect, policy: &Policy) -> anyhow::Result<String> {
    let (text, parameters, _) = translate_sql(query, dialect, policy)?;
    let pretty = sqlformat::format(
        &text,
        &sqlformat::QueryParams::None,
        sqlformat::FormatOptions::default(),
    );
    let names: Vec<&str> = parameters.iter().map(|p| p.name.as_str()).collect();
    Ok(format!("{pretty}\n\n{names:?}"))
}
