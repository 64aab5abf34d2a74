//! Pre-evaluation of locally reducible subtrees.

use query_engine_sql::sql::ast::{ExprRef, Expression};
use query_engine_sql::sql::evaluate::{depends_on_inputs, is_host_evaluable, Arguments, Bindings};
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::visitor::{walk, Rewriter};

/// Fold every maximal host-only subtree that reads no argument or lambda parameter
/// into a constant. Subtrees over plan arguments stay as host values.
pub fn partially_evaluate(expression: &ExprRef) -> ExprRef {
    let arguments = Arguments::new();
    PartialEvaluator {
        bindings: Bindings::new(&arguments),
    }
    .rewrite(expression)
}

struct PartialEvaluator<'a> {
    bindings: Bindings<'a>,
}

impl Rewriter for PartialEvaluator<'_> {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Constant { .. } | Expression::Lambda { .. } => walk(self, expression),
            other if is_host_evaluable(other) && !depends_on_inputs(other) => {
                match self.bindings.evaluate(other) {
                    Ok(value) => helpers::typed_constant(value, other.r#type()),
                    // left for the database or the plan to report
                    Err(_) => walk(self, expression),
                }
            }
            _ => walk(self, expression),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_metadata::metadata::ScalarType;
    use query_engine_sql::sql::ast::Function;
    use query_engine_sql::sql::types::Type;
    use query_engine_sql::sql::value::Value;

    #[test]
    fn constant_arithmetic_is_folded() {
        let tree = helpers::where_(
            helpers::entity_set("Order"),
            helpers::lambda("o", |o| {
                helpers::greater_than(
                    helpers::member(&o, "Total"),
                    helpers::add(helpers::constant(40), helpers::constant(2)),
                )
            }),
        );
        let folded = partially_evaluate(&tree);
        let Expression::Call { arguments, .. } = &*folded else {
            panic!("expected call");
        };
        let Expression::Lambda { body, .. } = &*arguments[1] else {
            panic!("expected lambda");
        };
        let Expression::Binary { right, .. } = &**body else {
            panic!("expected comparison");
        };
        assert_eq!(
            **right,
            Expression::Constant {
                value: Value::Int(42),
                r#type: Type::Scalar(ScalarType::Integer)
            }
        );
    }

    #[test]
    fn arguments_and_server_functions_are_kept() {
        let over_argument = helpers::add(
            helpers::argument("limit", Type::Scalar(ScalarType::Integer)),
            helpers::constant(1),
        );
        assert_eq!(partially_evaluate(&over_argument), over_argument);

        let now = helpers::function(Function::Now, vec![]);
        assert_eq!(partially_evaluate(&now), now);
    }
}
