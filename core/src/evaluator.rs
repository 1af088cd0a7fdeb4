// cellgrid-core/src/evaluator.rs
// AST evaluation against a read-only sheet view

use crate::ast::{AstNode, BinaryOperator, UnaryOperator};
use crate::error::CellError;
use crate::model::{CellValue, Position, Sheet};

/// Evaluate `node` against `sheet`. Recursion through referenced cells goes
/// via [`crate::model::Cell::value`], so every visited cell memoizes its
/// result; the sheet's acyclicity invariant bounds the recursion.
pub fn evaluate(node: &AstNode, sheet: &Sheet) -> Result<f64, CellError> {
    match node {
        AstNode::Number(value) => Ok(*value),
        AstNode::Reference(pos) => reference_value(sheet, *pos),
        AstNode::UnaryOp { op, operand } => {
            let value = evaluate(operand, sheet)?;
            Ok(match op {
                UnaryOperator::Positive => value,
                UnaryOperator::Negative => -value,
            })
        }
        AstNode::BinaryOp { op, left, right } => {
            let left = evaluate(left, sheet)?;
            let right = evaluate(right, sheet)?;
            match op {
                BinaryOperator::Add => Ok(left + right),
                BinaryOperator::Subtract => Ok(left - right),
                BinaryOperator::Multiply => Ok(left * right),
                BinaryOperator::Divide => {
                    if right == 0.0 {
                        Err(CellError::DivisionByZero)
                    } else {
                        Ok(left / right)
                    }
                }
            }
        }
    }
}

// A referenced cell contributes its numeric reading: numbers directly, the
// empty string as zero, other text through a decimal parse. Out-of-range
// and unset positions read as #REF!; a referenced error propagates.
fn reference_value(sheet: &Sheet, pos: Position) -> Result<f64, CellError> {
    if !pos.is_valid() {
        return Err(CellError::InvalidReference);
    }
    let Some(cell) = sheet.cell_at(pos) else {
        return Err(CellError::InvalidReference);
    };
    match cell.value(sheet) {
        CellValue::Number(value) => Ok(value),
        CellValue::Text(text) if text.is_empty() => Ok(0.0),
        CellValue::Text(text) => text.parse().map_err(|_| CellError::InvalidValue),
        CellValue::Error(error) => Err(error),
    }
}
