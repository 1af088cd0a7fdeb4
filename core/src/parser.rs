// cellgrid-core/src/parser.rs
// Formula parsing using pest

use std::sync::OnceLock;

use pest::iterators::Pairs;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};

use crate::ast::{AstNode, BinaryOperator, UnaryOperator};
use crate::error::{CellError, EngineError};
use crate::evaluator;
use crate::model::{Position, Sheet};

#[derive(Parser)]
#[grammar = "grammar/formula.pest"]
struct FormulaParser;

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        PrattParser::new()
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::subtract, Assoc::Left))
            .op(Op::infix(Rule::multiply, Assoc::Left) | Op::infix(Rule::divide, Assoc::Left))
            .op(Op::prefix(Rule::positive) | Op::prefix(Rule::negative))
    })
}

/// A parsed formula: the AST plus its canonical printed form. A cell stores
/// `=` followed by [`Formula::expression`], so re-setting a cell from its
/// own stored text is byte-identical and short-circuits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    ast: AstNode,
    expression: String,
}

impl Formula {
    /// Canonical printed form, without the leading `=`.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Positions the formula names, sorted row-major; duplicates are kept
    /// (callers deduplicate). References outside the supported grid are
    /// filtered out here — they evaluate to `#REF!` but never reach the
    /// dependency graph.
    pub fn referenced_cells(&self) -> Vec<Position> {
        let mut cells = Vec::new();
        self.ast.collect_references(&mut cells);
        cells.retain(|pos| pos.is_valid());
        cells.sort();
        cells
    }

    /// Evaluate against a read-only sheet view. Errors are values, not call
    /// failures.
    pub fn evaluate(&self, sheet: &Sheet) -> Result<f64, CellError> {
        evaluator::evaluate(&self.ast, sheet)
    }
}

/// Parse `expression` (the cell text without its leading `=`).
pub fn parse_formula(expression: &str) -> Result<Formula, EngineError> {
    let mut pairs = FormulaParser::parse(Rule::formula, expression)
        .map_err(|error| EngineError::Parse(error.to_string()))?;
    let expr = pairs
        .next()
        .ok_or_else(|| EngineError::Parse(format!("empty formula {:?}", expression)))?;
    let ast = build_ast(expr.into_inner())?;
    let expression = ast.to_string();
    Ok(Formula { ast, expression })
}

fn build_ast(pairs: Pairs<Rule>) -> Result<AstNode, EngineError> {
    pratt()
        .map_primary(|primary| match primary.as_rule() {
            Rule::number => primary
                .as_str()
                .parse::<f64>()
                .map(AstNode::Number)
                .map_err(|error| {
                    EngineError::Parse(format!(
                        "bad number literal {:?}: {}",
                        primary.as_str(),
                        error
                    ))
                }),
            Rule::reference => {
                let pos = Position::from_a1(primary.as_str());
                if pos == Position::NONE {
                    Err(EngineError::Parse(format!(
                        "cell reference {:?} cannot be represented",
                        primary.as_str()
                    )))
                } else {
                    Ok(AstNode::Reference(pos))
                }
            }
            Rule::expr => build_ast(primary.into_inner()),
            rule => Err(EngineError::Parse(format!("unexpected rule {:?}", rule))),
        })
        .map_prefix(|op, operand| {
            let op = match op.as_rule() {
                Rule::positive => UnaryOperator::Positive,
                Rule::negative => UnaryOperator::Negative,
                rule => {
                    return Err(EngineError::Parse(format!(
                        "unexpected prefix operator {:?}",
                        rule
                    )))
                }
            };
            Ok(AstNode::UnaryOp {
                op,
                operand: Box::new(operand?),
            })
        })
        .map_infix(|left, op, right| {
            let op = match op.as_rule() {
                Rule::add => BinaryOperator::Add,
                Rule::subtract => BinaryOperator::Subtract,
                Rule::multiply => BinaryOperator::Multiply,
                Rule::divide => BinaryOperator::Divide,
                rule => {
                    return Err(EngineError::Parse(format!(
                        "unexpected infix operator {:?}",
                        rule
                    )))
                }
            };
            Ok(AstNode::BinaryOp {
                op,
                left: Box::new(left?),
                right: Box::new(right?),
            })
        })
        .parse(pairs)
}
