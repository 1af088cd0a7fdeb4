//! demos/basic.rs
//! A small walkthrough of the sheet: literals, escaped text, formulas, and
//! cache invalidation after an edit.

use std::io;

use cellgrid_core::{new_sheet, Position};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut sheet = new_sheet();

    sheet.set_cell(Position::from_a1("A1"), "2")?;
    sheet.set_cell(Position::from_a1("B1"), "3.5")?;
    sheet.set_cell(Position::from_a1("C1"), "=(A1+B1)*2")?;
    sheet.set_cell(Position::from_a1("A2"), "'=not a formula")?;

    println!("texts:");
    sheet.print_texts(&mut io::stdout())?;

    println!("values:");
    sheet.print_values(&mut io::stdout())?;

    sheet.set_cell(Position::from_a1("A1"), "10")?;
    println!("values after A1 = 10:");
    sheet.print_values(&mut io::stdout())?;

    Ok(())
}
