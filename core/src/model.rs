// cellgrid-core/src/model.rs
// Core data structures: positions, cells, the dependency graph, and the sheet

use std::cell::RefCell;
use std::cmp;
use std::fmt;
use std::io::{self, Write};

use hashbrown::{HashMap, HashSet};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{CellError, EngineError};
use crate::parser::{parse_formula, Formula};

/// Largest addressable grid. References beyond these bounds parse but
/// evaluate to `#REF!` and never enter the dependency graph.
pub const MAX_ROWS: i32 = 16_384;
pub const MAX_COLS: i32 = 16_384;

const FORMULA_SIGN: char = '=';
const ESCAPE_SIGN: char = '\'';

// Cell address (row, column), zero-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub row: i32,
    pub col: i32,
}

impl Position {
    /// The sentinel returned for malformed textual addresses.
    pub const NONE: Position = Position { row: -1, col: -1 };

    pub fn new(row: i32, col: i32) -> Self {
        Position { row, col }
    }

    pub fn is_valid(&self) -> bool {
        (0..MAX_ROWS).contains(&self.row) && (0..MAX_COLS).contains(&self.col)
    }

    /// Parse A1 notation. Malformed input, or letter/digit runs too large to
    /// represent, yield [`Position::NONE`]; a well-formed address outside the
    /// supported grid yields a position for which `is_valid()` is false.
    pub fn from_a1(text: &str) -> Self {
        let letters_end = text
            .find(|c: char| !c.is_ascii_uppercase())
            .unwrap_or(text.len());
        let (letters, digits) = text.split_at(letters_end);
        if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Position::NONE;
        }

        // Column letters are a 1-based base-26 numeral
        let mut col: i64 = 0;
        for b in letters.bytes() {
            col = col * 26 + i64::from(b - b'A') + 1;
            if col > i64::from(i32::MAX) {
                return Position::NONE;
            }
        }

        let row: i64 = match digits.parse() {
            Ok(row) => row,
            Err(_) => return Position::NONE,
        };
        if row < 1 || row > i64::from(i32::MAX) {
            return Position::NONE;
        }

        Position {
            row: (row - 1) as i32,
            col: (col - 1) as i32,
        }
    }

    // Convert to A1 notation
    pub fn to_a1(&self) -> String {
        if self.row < 0 || self.col < 0 {
            return String::new();
        }

        let mut letters = String::new();
        let mut col = self.col + 1; // 1-based for the conversion
        while col > 0 {
            let remainder = (col - 1) % 26;
            letters.push((b'A' + remainder as u8) as char);
            col = (col - remainder) / 26;
        }

        format!("{}{}", letters.chars().rev().collect::<String>(), self.row + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.row >= 0 && self.col >= 0 {
            write!(f, "{}", self.to_a1())
        } else {
            write!(f, "({}, {})", self.row, self.col)
        }
    }
}

/// The tight bounding rectangle of present cells, anchored at (0, 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub rows: i32,
    pub cols: i32,
}

// Displayed cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Error(CellError),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(text) => write!(f, "{}", text),
            CellValue::Number(value) => write!(f, "{}", value),
            CellValue::Error(error) => write!(f, "{}", error),
        }
    }
}

/// What a cell holds: nothing, raw text, or a parsed formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellContent {
    Empty,
    Text(String),
    Formula(Formula),
}

impl CellContent {
    /// The stored text: empty, the raw string, or `=` plus the canonical
    /// expression.
    pub fn text(&self) -> String {
        match self {
            CellContent::Empty => String::new(),
            CellContent::Text(text) => text.clone(),
            CellContent::Formula(formula) => format!("={}", formula.expression()),
        }
    }

    /// The displayed value. A leading `'` in text content is stripped here
    /// and nowhere else; the stored text keeps it.
    pub fn value(&self, sheet: &Sheet) -> CellValue {
        match self {
            CellContent::Empty => CellValue::Text(String::new()),
            CellContent::Text(text) => {
                CellValue::Text(text.strip_prefix(ESCAPE_SIGN).unwrap_or(text).to_string())
            }
            CellContent::Formula(formula) => match formula.evaluate(sheet) {
                Ok(value) => CellValue::Number(value),
                Err(error) => CellValue::Error(error),
            },
        }
    }
}

// Cell structure
#[derive(Debug)]
pub struct Cell {
    content: CellContent,
    referenced: Vec<Position>,
    cache: RefCell<Option<CellValue>>,
}

impl Cell {
    fn new() -> Self {
        Cell {
            content: CellContent::Empty,
            referenced: Vec::new(),
            cache: RefCell::new(None),
        }
    }

    pub fn content(&self) -> &CellContent {
        &self.content
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Memoized value. Every cell touched by a recursive evaluation caches
    /// its own result; invalidation pruning relies on that.
    pub fn value(&self, sheet: &Sheet) -> CellValue {
        if let Some(value) = self.cache.borrow().as_ref() {
            return value.clone();
        }
        let value = self.content.value(sheet);
        *self.cache.borrow_mut() = Some(value.clone());
        value
    }

    /// Positions this cell's formula names, sorted and deduplicated. Empty
    /// for non-formula cells.
    pub fn referenced_cells(&self) -> &[Position] {
        &self.referenced
    }

    fn invalidate(&mut self) -> bool {
        self.cache.get_mut().take().is_some()
    }
}

/// Two directed relations over positions. `adjacency` records what each
/// cell's formula references; `dependency` records who references each cell.
/// The sheet's edit path keeps the two in lockstep; the graph itself does
/// not enforce that mirror. Missing keys read as empty sets.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    adjacency: HashMap<Position, HashSet<Position>>,
    dependency: HashMap<Position, HashSet<Position>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Forward edges from `pos`: the positions its formula references.
    pub fn adjacency(&self, pos: Position) -> impl Iterator<Item = Position> + '_ {
        self.adjacency.get(&pos).into_iter().flatten().copied()
    }

    /// Backward edges to `pos`: the positions whose formulas reference it.
    pub fn dependency(&self, pos: Position) -> impl Iterator<Item = Position> + '_ {
        self.dependency.get(&pos).into_iter().flatten().copied()
    }

    pub fn add_adjacency(&mut self, target: Position, adding: Position) {
        self.adjacency.entry(target).or_default().insert(adding);
    }

    pub fn remove_adjacency(&mut self, target: Position, removing: Position) {
        if let Some(set) = self.adjacency.get_mut(&target) {
            set.remove(&removing);
            if set.is_empty() {
                self.adjacency.remove(&target);
            }
        }
    }

    pub fn add_dependency(&mut self, target: Position, adding: Position) {
        self.dependency.entry(target).or_default().insert(adding);
    }

    pub fn remove_dependency(&mut self, target: Position, removing: Position) {
        if let Some(set) = self.dependency.get_mut(&target) {
            set.remove(&removing);
            if set.is_empty() {
                self.dependency.remove(&target);
            }
        }
    }

    /// Would giving `pos` the candidate referenced-set close a cycle?
    /// Purely observational: the candidate edges are never placed in the
    /// graph. A cycle exists iff something reachable forward from the
    /// candidate set lands in `{pos}` plus everything that transitively
    /// references `pos`.
    pub fn creates_cycle(&self, pos: Position, candidate: &[Position]) -> bool {
        if candidate.contains(&pos) {
            return true;
        }

        let mut closure: HashSet<Position> = HashSet::new();
        closure.insert(pos);
        let mut stack: Vec<Position> = self.dependency(pos).collect();
        while let Some(current) = stack.pop() {
            if closure.insert(current) {
                stack.extend(self.dependency(current));
            }
        }

        let mut visited: HashSet<Position> = HashSet::new();
        let mut stack: Vec<Position> = candidate.to_vec();
        while let Some(current) = stack.pop() {
            if closure.contains(&current) {
                return true;
            }
            if visited.insert(current) {
                stack.extend(self.adjacency(current));
            }
        }

        false
    }
}

// Sheet structure: sparse grid plus the dependency graph
pub struct Sheet {
    cells: HashMap<Position, Cell>,
    graph: DependencyGraph,
    printable: Size,
}

impl Sheet {
    pub fn new() -> Self {
        Sheet {
            cells: HashMap::new(),
            graph: DependencyGraph::new(),
            printable: Size::default(),
        }
    }

    /// Set the cell at `pos` from its textual input. Leading `=` with more
    /// text parses as a formula, a lone `=` and everything else is text.
    /// Fails with `InvalidPosition`, `Parse`, or `CircularDependency` before
    /// any state changes.
    pub fn set_cell(&mut self, pos: Position, text: &str) -> Result<(), EngineError> {
        Self::ensure_valid(pos)?;

        if let Some(cell) = self.cells.get(&pos) {
            if cell.text() == text {
                trace!("set at {} matches stored text, nothing to do", pos);
                return Ok(());
            }
        }

        let (content, referenced) = self.build_content(pos, text)?;
        debug!("set {} to {:?}", pos, text);

        let cell = self.cells.entry(pos).or_insert_with(Cell::new);
        cell.content = content;
        cell.referenced = referenced;
        cell.invalidate();

        self.rewire(pos);
        self.invalidate_dependents(pos);
        self.printable.rows = cmp::max(self.printable.rows, pos.row + 1);
        self.printable.cols = cmp::max(self.printable.cols, pos.col + 1);
        Ok(())
    }

    /// Remove the cell at `pos`, dropping its outgoing edges and clearing
    /// the caches of everything that referenced it. Incoming edges stay;
    /// formulas still naming `pos` evaluate to `#REF!`.
    pub fn clear_cell(&mut self, pos: Position) -> Result<(), EngineError> {
        Self::ensure_valid(pos)?;
        if self.cells.remove(&pos).is_none() {
            return Ok(());
        }
        debug!("clear {}", pos);

        self.rewire(pos);
        self.invalidate_dependents(pos);
        self.shrink_printable();
        Ok(())
    }

    /// The cell at `pos`, or `None` if it was never set. Only the position
    /// itself can fail.
    pub fn get_cell(&self, pos: Position) -> Result<Option<&Cell>, EngineError> {
        Self::ensure_valid(pos)?;
        Ok(self.cells.get(&pos))
    }

    /// Displayed value at `pos`; unset cells read as the empty string.
    pub fn value(&self, pos: Position) -> Result<CellValue, EngineError> {
        Ok(match self.get_cell(pos)? {
            Some(cell) => cell.value(self),
            None => CellValue::Text(String::new()),
        })
    }

    pub fn printable_size(&self) -> Size {
        self.printable
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Emit displayed values over the printable rectangle: tab-separated
    /// cells, newline-terminated rows, nothing between tabs for gaps.
    pub fn print_values<W: Write>(&self, output: &mut W) -> io::Result<()> {
        self.print_each(output, |cell, output| write!(output, "{}", cell.value(self)))
    }

    /// Emit stored texts over the printable rectangle, same grammar.
    pub fn print_texts<W: Write>(&self, output: &mut W) -> io::Result<()> {
        self.print_each(output, |cell, output| write!(output, "{}", cell.text()))
    }

    // Unvalidated lookup for the evaluator, which reports bad references as
    // value-class errors instead of call failures.
    pub(crate) fn cell_at(&self, pos: Position) -> Option<&Cell> {
        self.cells.get(&pos)
    }

    fn ensure_valid(pos: Position) -> Result<(), EngineError> {
        if pos.is_valid() {
            Ok(())
        } else {
            Err(EngineError::InvalidPosition(format!(
                "({}, {})",
                pos.row, pos.col
            )))
        }
    }

    fn build_content(
        &self,
        pos: Position,
        text: &str,
    ) -> Result<(CellContent, Vec<Position>), EngineError> {
        let mut chars = text.chars();
        let is_formula = chars.next() == Some(FORMULA_SIGN) && chars.next().is_some();
        if !is_formula {
            return Ok((CellContent::Text(text.to_string()), Vec::new()));
        }

        let formula = parse_formula(&text[1..])?;
        let mut referenced = formula.referenced_cells();
        referenced.dedup();
        if self.graph.creates_cycle(pos, &referenced) {
            return Err(EngineError::CircularDependency {
                position: pos.to_a1(),
                text: text.to_string(),
            });
        }
        Ok((CellContent::Formula(formula), referenced))
    }

    // Bring the graph in line with the cell's current referenced-set (empty
    // when the cell is gone). Removals are staged into a Vec first so the
    // adjacency set is not mutated while it is being read.
    fn rewire(&mut self, pos: Position) {
        let stale: Vec<Position> = self.graph.adjacency(pos).collect();
        for target in stale {
            self.graph.remove_dependency(target, pos);
            self.graph.remove_adjacency(pos, target);
        }

        let fresh = match self.cells.get(&pos) {
            Some(cell) => cell.referenced.clone(),
            None => Vec::new(),
        };
        for target in fresh {
            self.graph.add_adjacency(pos, target);
            self.graph.add_dependency(target, pos);
        }
    }

    // Walk backward edges from `pos` clearing caches. A dependent whose
    // cache is already empty ends that branch: its own dependents lost their
    // caches when it lost its own.
    fn invalidate_dependents(&mut self, pos: Position) {
        let mut stack: Vec<Position> = self.graph.dependency(pos).collect();
        while let Some(current) = stack.pop() {
            let had_cache = match self.cells.get_mut(&current) {
                Some(cell) => cell.invalidate(),
                None => false,
            };
            if had_cache {
                trace!("dropped cached value at {}", current);
                stack.extend(self.graph.dependency(current));
            }
        }
    }

    fn shrink_printable(&mut self) {
        let mut size = Size::default();
        for pos in self.cells.keys() {
            size.rows = cmp::max(size.rows, pos.row + 1);
            size.cols = cmp::max(size.cols, pos.col + 1);
        }
        self.printable = size;
    }

    fn print_each<W, F>(&self, output: &mut W, mut emit: F) -> io::Result<()>
    where
        W: Write,
        F: FnMut(&Cell, &mut W) -> io::Result<()>,
    {
        for row in 0..self.printable.rows {
            for col in 0..self.printable.cols {
                if col != 0 {
                    write!(output, "\t")?;
                }
                if let Some(cell) = self.cells.get(&Position::new(row, col)) {
                    emit(cell, output)?;
                }
            }
            writeln!(output)?;
        }
        Ok(())
    }
}

impl Default for Sheet {
    fn default() -> Self {
        Sheet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(text: &str) -> Position {
        Position::from_a1(text)
    }

    fn cached(sheet: &Sheet, name: &str) -> bool {
        sheet.cells[&pos(name)].cache.borrow().is_some()
    }

    #[test]
    fn position_a1_round_trip() {
        assert_eq!(pos("A1"), Position::new(0, 0));
        assert_eq!(pos("B10"), Position::new(9, 1));
        assert_eq!(pos("Z1"), Position::new(0, 25));
        assert_eq!(pos("AA1"), Position::new(0, 26));
        assert_eq!(pos("XFD1"), Position::new(0, 16_383));

        assert_eq!(Position::new(0, 0).to_a1(), "A1");
        assert_eq!(Position::new(9, 1).to_a1(), "B10");
        assert_eq!(Position::new(0, 26).to_a1(), "AA1");
        assert_eq!(Position::new(16_383, 16_383).to_a1(), "XFD16384");
    }

    #[test]
    fn position_malformed_is_none() {
        for text in ["", "A", "1", "1A", "a1", "A0", "A-1", "A1B", "A 1"] {
            assert_eq!(pos(text), Position::NONE, "{:?}", text);
        }
    }

    #[test]
    fn position_out_of_range_is_invalid_but_not_none() {
        let below = pos("A16385");
        assert_ne!(below, Position::NONE);
        assert!(!below.is_valid());

        let right = pos("XFE1");
        assert_ne!(right, Position::NONE);
        assert!(!right.is_valid());

        assert!(pos("A16384").is_valid());
        assert!(pos("XFD16384").is_valid());
    }

    #[test]
    fn position_orders_row_major() {
        let mut cells = vec![pos("B1"), pos("A2"), pos("A1")];
        cells.sort();
        assert_eq!(cells, vec![pos("A1"), pos("B1"), pos("A2")]);
    }

    #[test]
    fn position_serializes() {
        let json = serde_json::to_string(&Position::new(2, 3)).unwrap();
        assert_eq!(json, r#"{"row":2,"col":3}"#);
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Position::new(2, 3));
    }

    #[test]
    fn graph_reads_missing_keys_as_empty() {
        let graph = DependencyGraph::new();
        assert_eq!(graph.adjacency(pos("A1")).count(), 0);
        assert_eq!(graph.dependency(pos("A1")).count(), 0);
    }

    #[test]
    fn graph_mirror_holds_after_edits() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "1").unwrap();
        sheet.set_cell(pos("B1"), "=A1+1").unwrap();
        sheet.set_cell(pos("C1"), "=A1+B1").unwrap();
        sheet.set_cell(pos("B1"), "=A1*2").unwrap();
        sheet.clear_cell(pos("C1")).unwrap();

        let positions = [pos("A1"), pos("B1"), pos("C1")];
        for p in positions {
            for q in sheet.graph.adjacency(p).collect::<Vec<_>>() {
                assert!(
                    sheet.graph.dependency(q).any(|d| d == p),
                    "missing mirror of {} -> {}",
                    p,
                    q
                );
            }
            for q in sheet.graph.dependency(p).collect::<Vec<_>>() {
                assert!(
                    sheet.graph.adjacency(q).any(|a| a == p),
                    "missing mirror of {} <- {}",
                    p,
                    q
                );
            }
        }

        assert_eq!(sheet.graph.adjacency(pos("C1")).count(), 0);
        assert_eq!(
            sheet.graph.adjacency(pos("B1")).collect::<Vec<_>>(),
            vec![pos("A1")]
        );
    }

    #[test]
    fn rejected_edit_leaves_graph_and_content_alone() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "=B1").unwrap();
        sheet.set_cell(pos("B1"), "10").unwrap();

        let err = sheet.set_cell(pos("B1"), "=A1").unwrap_err();
        assert!(matches!(err, EngineError::CircularDependency { .. }));

        assert_eq!(sheet.cells[&pos("B1")].text(), "10");
        assert_eq!(sheet.graph.adjacency(pos("B1")).count(), 0);
        assert_eq!(
            sheet.graph.dependency(pos("B1")).collect::<Vec<_>>(),
            vec![pos("A1")]
        );
    }

    #[test]
    fn evaluation_caches_every_cell_it_touches() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "1").unwrap();
        sheet.set_cell(pos("B1"), "=A1+1").unwrap();
        sheet.set_cell(pos("C1"), "=B1+1").unwrap();

        assert!(!cached(&sheet, "A1"));
        assert_eq!(sheet.value(pos("C1")).unwrap(), CellValue::Number(3.0));
        assert!(cached(&sheet, "A1"));
        assert!(cached(&sheet, "B1"));
        assert!(cached(&sheet, "C1"));
    }

    #[test]
    fn edit_invalidates_transitively() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "1").unwrap();
        sheet.set_cell(pos("B1"), "=A1+1").unwrap();
        sheet.set_cell(pos("C1"), "=B1+1").unwrap();
        sheet.value(pos("C1")).unwrap();

        sheet.set_cell(pos("A1"), "5").unwrap();
        assert!(!cached(&sheet, "A1"));
        assert!(!cached(&sheet, "B1"));
        assert!(!cached(&sheet, "C1"));
        assert_eq!(sheet.value(pos("C1")).unwrap(), CellValue::Number(7.0));
    }

    #[test]
    fn pruned_invalidation_stays_sound() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "1").unwrap();
        sheet.set_cell(pos("B1"), "=A1+1").unwrap();
        sheet.set_cell(pos("C1"), "=B1+1").unwrap();
        sheet.value(pos("C1")).unwrap();

        // First edit clears the whole chain; recompute only B1 so C1 stays
        // uncached, then edit again. The traversal prunes at C1 and the
        // chain still reads correctly afterwards.
        sheet.set_cell(pos("A1"), "5").unwrap();
        assert_eq!(sheet.value(pos("B1")).unwrap(), CellValue::Number(6.0));
        assert!(cached(&sheet, "B1"));
        assert!(!cached(&sheet, "C1"));

        sheet.set_cell(pos("A1"), "7").unwrap();
        assert!(!cached(&sheet, "B1"));
        assert_eq!(sheet.value(pos("C1")).unwrap(), CellValue::Number(9.0));
    }

    #[test]
    fn idempotent_set_keeps_caches() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "1").unwrap();
        sheet.set_cell(pos("B1"), "=A1+1").unwrap();
        sheet.value(pos("B1")).unwrap();

        sheet.set_cell(pos("B1"), "=A1+1").unwrap();
        assert!(cached(&sheet, "B1"));
        assert_eq!(sheet.printable_size(), Size { rows: 1, cols: 2 });
    }

    #[test]
    fn printable_grows_by_componentwise_max() {
        let mut sheet = Sheet::new();
        assert_eq!(sheet.printable_size(), Size::default());

        sheet.set_cell(pos("B3"), "x").unwrap();
        assert_eq!(sheet.printable_size(), Size { rows: 3, cols: 2 });

        sheet.set_cell(pos("D1"), "y").unwrap();
        assert_eq!(sheet.printable_size(), Size { rows: 3, cols: 4 });
    }

    #[test]
    fn clear_rescans_for_tight_printable() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "a").unwrap();
        sheet.set_cell(pos("C3"), "b").unwrap();
        assert_eq!(sheet.printable_size(), Size { rows: 3, cols: 3 });

        sheet.clear_cell(pos("C3")).unwrap();
        assert_eq!(sheet.printable_size(), Size { rows: 1, cols: 1 });

        sheet.clear_cell(pos("A1")).unwrap();
        assert_eq!(sheet.printable_size(), Size::default());
        assert_eq!(sheet.cell_count(), 0);
    }

    #[test]
    fn clear_drops_outgoing_edges() {
        let mut sheet = Sheet::new();
        sheet.set_cell(pos("A1"), "1").unwrap();
        sheet.set_cell(pos("B1"), "=A1").unwrap();
        sheet.clear_cell(pos("B1")).unwrap();

        assert_eq!(sheet.graph.adjacency(pos("B1")).count(), 0);
        assert_eq!(sheet.graph.dependency(pos("A1")).count(), 0);

        // A1 may reference the cleared slot again without a phantom cycle
        sheet.set_cell(pos("A1"), "=B1+1").unwrap();
        assert_eq!(
            sheet.value(pos("A1")).unwrap(),
            CellValue::Error(CellError::InvalidReference)
        );
    }
}
