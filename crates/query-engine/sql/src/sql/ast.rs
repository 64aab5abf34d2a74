//! Type definitions of the query IR.
//!
//! One closed node family covers the host query operators handed to the translator,
//! the relational nodes the translator produces, and the commands that modify data.
//! Children are shared through `Arc`, so rewriting passes keep unchanged subtrees.

use std::sync::Arc;

use enum_iterator::Sequence;
use query_engine_metadata::metadata::{DbType, EntityId, ScalarType};

use super::types::Type;
use super::value::Value;

/// A shared reference to an expression.
pub type ExprRef = Arc<Expression>;

/// Identity of one table or subquery occurrence. Columns resolve by alias identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableAlias(pub u64);

/// Mints fresh table aliases. Owned by a single translation.
#[derive(Debug, Default, Clone)]
pub struct AliasGenerator {
    next: u64,
}

impl AliasGenerator {
    pub fn new() -> Self {
        AliasGenerator { next: 0 }
    }

    pub fn next_alias(&mut self) -> TableAlias {
        let alias = TableAlias(self.next);
        self.next += 1;
        alias
    }
}

/// Binary operators shared by host and database expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    /// The left operand, or the right one when the left is null.
    Coalesce,
    /// String concatenation.
    Concat,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::LessThan
                | BinaryOperator::LessThanOrEqual
                | BinaryOperator::GreaterThan
                | BinaryOperator::GreaterThanOrEqual
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum UnaryOperator {
    Not,
    Negate,
    /// Conversion to the type of the node.
    Convert,
}

/// Scalar functions with a dialect-specific spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum Function {
    Upper,
    Lower,
    Length,
    Trim,
    Substring,
    StartsWith,
    EndsWith,
    Contains,
    Replace,
    Abs,
    Round,
    Floor,
    Ceiling,
    Now,
    Year,
    Month,
    Day,
}

impl Function {
    /// Functions rendered as `LIKE` predicates.
    pub fn is_predicate(self) -> bool {
        matches!(
            self,
            Function::StartsWith | Function::EndsWith | Function::Contains
        )
    }
}

/// The query and command operators a host query tree may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum QueryOperator {
    Where,
    Select,
    SelectMany,
    Join,
    GroupBy,
    OrderBy,
    OrderByDescending,
    ThenBy,
    ThenByDescending,
    Take,
    Skip,
    Distinct,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Any,
    All,
    Contains,
    Count,
    Sum,
    Min,
    Max,
    Average,
    Insert,
    Update,
    InsertOrUpdate,
    Delete,
    DeleteWhere,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    /// A left outer join matching at most one row; dropped when nothing reads its columns.
    SingletonLeftOuter,
    Cross,
    CrossApply,
    OuterApply,
}

impl JoinKind {
    pub fn name(self) -> &'static str {
        match self {
            JoinKind::Inner => "InnerJoin",
            JoinKind::LeftOuter => "LeftOuterJoin",
            JoinKind::SingletonLeftOuter => "SingletonLeftOuterJoin",
            JoinKind::Cross => "CrossJoin",
            JoinKind::CrossApply => "CrossApply",
            JoinKind::OuterApply => "OuterApply",
        }
    }

    pub fn is_apply(self) -> bool {
        matches!(self, JoinKind::CrossApply | JoinKind::OuterApply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ordering {
    Ascending,
    Descending,
}

/// How the rows produced for a projection become the value the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum Aggregator {
    Single,
    SingleOrDefault,
    First,
    FirstOrDefault,
    List,
}

impl Aggregator {
    /// Whether the aggregator yields one value rather than a sequence.
    pub fn is_singleton(self) -> bool {
        !matches!(self, Aggregator::List)
    }
}

/// A lambda parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterRef {
    pub name: String,
    pub r#type: Type,
}

/// A member initialised by a construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberBinding {
    pub member: String,
    pub expression: ExprRef,
}

/// A column declared by a select.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDeclaration {
    pub name: String,
    pub expression: ExprRef,
    pub query_type: Option<DbType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderExpression {
    pub ordering: Ordering,
    pub expression: ExprRef,
}

/// A SELECT: the canonical relational node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Select {
    pub alias: TableAlias,
    pub columns: Vec<ColumnDeclaration>,
    pub from: Option<ExprRef>,
    pub where_: Option<ExprRef>,
    pub group_by: Vec<ExprRef>,
    pub order_by: Vec<OrderExpression>,
    pub distinct: bool,
    pub skip: Option<ExprRef>,
    pub take: Option<ExprRef>,
}

impl Select {
    /// A select of the given columns and nothing else.
    pub fn new(alias: TableAlias, columns: Vec<ColumnDeclaration>, from: Option<ExprRef>) -> Self {
        Select {
            alias,
            columns,
            from,
            where_: None,
            group_by: vec![],
            order_by: vec![],
            distinct: false,
            skip: None,
            take: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDeclaration> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// A column name not yet declared by this select, based on `base`.
    pub fn available_column_name(&self, base: &str) -> String {
        available_column_name(&self.columns, base)
    }
}

/// A column name not among `columns`, based on `base`.
pub fn available_column_name(columns: &[ColumnDeclaration], base: &str) -> String {
    let taken = |name: &str| columns.iter().any(|column| column.name == name);
    if !taken(base) {
        return base.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{base}{suffix}");
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// The right-hand side of an IN test.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InSource {
    Select(Arc<Select>),
    Values(Vec<ExprRef>),
}

/// A table occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub alias: TableAlias,
    pub entity: Option<EntityId>,
    pub name: String,
}

/// `column = expression` in an INSERT or UPDATE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnAssignment {
    pub column: ExprRef,
    pub expression: ExprRef,
}

/// A variable declared by a `Declaration` and initialised from its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableDeclaration {
    pub name: String,
    pub r#type: Type,
    pub query_type: Option<DbType>,
    pub expression: ExprRef,
}

/// An IR node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expression {
    // host nodes
    Constant {
        value: Value,
        r#type: Type,
    },
    /// A value supplied when the plan is executed.
    Argument {
        name: String,
        r#type: Type,
    },
    Parameter(ParameterRef),
    Lambda {
        parameters: Vec<ParameterRef>,
        body: ExprRef,
    },
    Member {
        expression: ExprRef,
        member: String,
        r#type: Type,
    },
    Binary {
        operator: BinaryOperator,
        left: ExprRef,
        right: ExprRef,
        r#type: Type,
    },
    Unary {
        operator: UnaryOperator,
        operand: ExprRef,
        r#type: Type,
    },
    Conditional {
        test: ExprRef,
        if_true: ExprRef,
        if_false: ExprRef,
        r#type: Type,
    },
    /// Construction of an object: constructor arguments in parameter order, then
    /// member initialisations.
    Construct {
        type_name: String,
        constructor: Option<usize>,
        arguments: Vec<MemberBinding>,
        bindings: Vec<MemberBinding>,
    },
    Call {
        operator: QueryOperator,
        arguments: Vec<ExprRef>,
        r#type: Type,
    },
    Function {
        function: Function,
        arguments: Vec<ExprRef>,
        r#type: Type,
    },
    /// The collection of all instances of a mapped entity.
    EntitySet {
        entity: EntityId,
        r#type: Type,
    },
    /// A group produced by a group-by: its key and its elements.
    Grouping {
        key: ExprRef,
        group: ExprRef,
        r#type: Type,
    },

    // database nodes
    Table(TableRef),
    Column {
        alias: TableAlias,
        name: String,
        r#type: Type,
        query_type: Option<DbType>,
    },
    Select(Arc<Select>),
    Join {
        kind: JoinKind,
        left: ExprRef,
        right: ExprRef,
        condition: Option<ExprRef>,
    },
    Aggregate {
        function: AggregateFunction,
        argument: Option<ExprRef>,
        distinct: bool,
        r#type: Type,
    },
    /// An aggregate over a group, kept both as the expression legal in the grouping
    /// select and as an equivalent scalar subquery.
    AggregateSubquery {
        group_by_alias: TableAlias,
        aggregate: ExprRef,
        subquery: ExprRef,
    },
    Exists(Arc<Select>),
    In {
        expression: ExprRef,
        source: InSource,
    },
    Scalar {
        select: Arc<Select>,
        r#type: Type,
    },
    Between {
        expression: ExprRef,
        lower: ExprRef,
        upper: ExprRef,
    },
    IsNull(ExprRef),
    RowNumber {
        order_by: Vec<OrderExpression>,
    },
    /// A raw database function or primitive; no parentheses when `arguments` is `None`.
    DbFunction {
        name: String,
        arguments: Option<Vec<ExprRef>>,
        r#type: Type,
    },
    /// A query paired with the construction of one result per row.
    Projection {
        select: Arc<Select>,
        projector: ExprRef,
        aggregator: Option<Aggregator>,
        deferred: bool,
    },
    /// A plural relationship resolved by a separate query joined in memory.
    ClientJoin {
        outer_key: Vec<ExprRef>,
        inner_key: Vec<ExprRef>,
        projection: ExprRef,
    },
    /// A construction bound to the entity mapping it builds.
    Entity {
        entity: EntityId,
        expression: ExprRef,
    },
    /// `expression`, unless `test` reads null, in which case the type's default.
    OuterJoined {
        test: ExprRef,
        expression: ExprRef,
    },
    /// A named command parameter whose value is computed from `value` at execution.
    ClientParameter {
        name: String,
        r#type: Type,
        query_type: Option<DbType>,
        value: ExprRef,
    },

    // commands
    Insert {
        table: TableRef,
        assignments: Vec<ColumnAssignment>,
    },
    Update {
        table: TableRef,
        where_: Option<ExprRef>,
        assignments: Vec<ColumnAssignment>,
    },
    Delete {
        table: TableRef,
        where_: Option<ExprRef>,
    },
    Block(Vec<ExprRef>),
    If {
        check: ExprRef,
        if_true: ExprRef,
        if_false: Option<ExprRef>,
    },
    Declaration {
        variables: Vec<VariableDeclaration>,
        source: Option<Arc<Select>>,
    },
    Variable {
        name: String,
        r#type: Type,
        query_type: Option<DbType>,
    },
    /// A command applied to every element of `input`.
    Batch {
        input: ExprRef,
        operation: ExprRef,
        batch_size: usize,
        stream: bool,
    },
}

impl Expression {
    /// The name of the node kind, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expression::Constant { .. } => "Constant",
            Expression::Argument { .. } => "Argument",
            Expression::Parameter(_) => "Parameter",
            Expression::Lambda { .. } => "Lambda",
            Expression::Member { .. } => "Member",
            Expression::Binary { .. } => "Binary",
            Expression::Unary { .. } => "Unary",
            Expression::Conditional { .. } => "Conditional",
            Expression::Construct { .. } => "Construct",
            Expression::Call { .. } => "Call",
            Expression::Function { .. } => "Function",
            Expression::EntitySet { .. } => "EntitySet",
            Expression::Grouping { .. } => "Grouping",
            Expression::Table(_) => "Table",
            Expression::Column { .. } => "Column",
            Expression::Select(_) => "Select",
            Expression::Join { .. } => "Join",
            Expression::Aggregate { .. } => "Aggregate",
            Expression::AggregateSubquery { .. } => "AggregateSubquery",
            Expression::Exists(_) => "Exists",
            Expression::In { .. } => "In",
            Expression::Scalar { .. } => "Scalar",
            Expression::Between { .. } => "Between",
            Expression::IsNull(_) => "IsNull",
            Expression::RowNumber { .. } => "RowNumber",
            Expression::DbFunction { .. } => "DbFunction",
            Expression::Projection { .. } => "Projection",
            Expression::ClientJoin { .. } => "ClientJoin",
            Expression::Entity { .. } => "Entity",
            Expression::OuterJoined { .. } => "OuterJoined",
            Expression::ClientParameter { .. } => "ClientParameter",
            Expression::Insert { .. } => "Insert",
            Expression::Update { .. } => "Update",
            Expression::Delete { .. } => "Delete",
            Expression::Block(_) => "Block",
            Expression::If { .. } => "If",
            Expression::Declaration { .. } => "Declaration",
            Expression::Variable { .. } => "Variable",
            Expression::Batch { .. } => "Batch",
        }
    }

    /// The host type of the value this node produces.
    pub fn r#type(&self) -> Type {
        match self {
            Expression::Constant { r#type, .. }
            | Expression::Argument { r#type, .. }
            | Expression::Parameter(ParameterRef { r#type, .. })
            | Expression::Member { r#type, .. }
            | Expression::Binary { r#type, .. }
            | Expression::Unary { r#type, .. }
            | Expression::Conditional { r#type, .. }
            | Expression::Call { r#type, .. }
            | Expression::Function { r#type, .. }
            | Expression::EntitySet { r#type, .. }
            | Expression::Grouping { r#type, .. }
            | Expression::Column { r#type, .. }
            | Expression::Aggregate { r#type, .. }
            | Expression::Scalar { r#type, .. }
            | Expression::DbFunction { r#type, .. }
            | Expression::ClientParameter { r#type, .. }
            | Expression::Variable { r#type, .. } => r#type.clone(),
            Expression::Lambda { body, .. } => body.r#type(),
            Expression::Construct { type_name, .. } => Type::Object(type_name.clone()),
            Expression::Table(_) | Expression::Select(_) | Expression::Join { .. } => {
                Type::sequence(Type::Any)
            }
            Expression::AggregateSubquery { aggregate, .. } => aggregate.r#type(),
            Expression::Exists(_)
            | Expression::In { .. }
            | Expression::Between { .. }
            | Expression::IsNull(_) => Type::Scalar(ScalarType::Boolean),
            Expression::RowNumber { .. } => Type::Scalar(ScalarType::BigInt),
            Expression::Projection {
                projector,
                aggregator,
                ..
            } => match aggregator {
                Some(aggregator) if aggregator.is_singleton() => projector.r#type(),
                _ => Type::sequence(projector.r#type()),
            },
            Expression::ClientJoin { projection, .. } => projection.r#type(),
            Expression::Entity { expression, .. } | Expression::OuterJoined { expression, .. } => {
                expression.r#type()
            }
            Expression::Block(commands) => commands.last().map_or(Type::Unit, |last| last.r#type()),
            Expression::If { if_true, .. } => if_true.r#type(),
            Expression::Insert { .. }
            | Expression::Update { .. }
            | Expression::Delete { .. }
            | Expression::Declaration { .. } => Type::Scalar(ScalarType::Integer),
            Expression::Batch { operation, .. } => Type::sequence(operation.r#type()),
        }
    }

    /// Whether this node is a predicate rather than a value in SQL.
    pub fn is_predicate(&self) -> bool {
        match self {
            Expression::Binary { operator, .. } => {
                operator.is_comparison() || operator.is_logical()
            }
            Expression::Unary {
                operator: UnaryOperator::Not,
                ..
            }
            | Expression::Exists(_)
            | Expression::In { .. }
            | Expression::Between { .. }
            | Expression::IsNull(_) => true,
            Expression::Function { function, .. } => function.is_predicate(),
            _ => false,
        }
    }

    /// Whether this node is a command rather than a query or value.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Expression::Insert { .. }
                | Expression::Update { .. }
                | Expression::Delete { .. }
                | Expression::Block(_)
                | Expression::If { .. }
                | Expression::Declaration { .. }
                | Expression::Batch { .. }
        )
    }

    /// The alias a source node declares, for tables and selects.
    pub fn declared_alias(&self) -> Option<TableAlias> {
        match self {
            Expression::Table(table) => Some(table.alias),
            Expression::Select(select) => Some(select.alias),
            _ => None,
        }
    }
}
