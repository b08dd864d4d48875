use thiserror::Error;

use crate::bytecode::CompileError;
use crate::frontend::lexer::LexerError;
use crate::frontend::parser_error::ParserError;
use crate::runtime::RuntimeError;
use crate::snapshot::SnapshotError;

/// Any failure of an evaluation, by stage.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexerError),
    #[error(transparent)]
    Parse(#[from] ParserError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl Error {
    /// The source ended inside an open block or string.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Lex(e) if e.is_incomplete())
    }
}
