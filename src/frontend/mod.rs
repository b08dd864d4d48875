pub mod lexer;
pub mod parser;
pub mod parser_error;
pub mod shaper;
pub mod token;
pub mod token_dumper;

use crate::error::Error;
use lexer::Lexer;
use parser::Parser;
use token::Token;

/// Lexes and shapes a source chunk. `labels` is the caller's label counter.
pub fn shape_source(source: &str, labels: &mut usize) -> Result<Vec<Token>, Error> {
    let tokens = Lexer::new(source).tokenize()?;
    let shaped = Parser::new(labels).parse(&tokens)?;
    Ok(shaped)
}
