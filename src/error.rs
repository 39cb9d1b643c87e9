use thiserror::Error;

use crate::handlers::Selector;

/// Failures surfaced while decoding wire data.
///
/// Wire-format errors and handler failures are treated identically: the
/// pipeline is marked failed, no further callbacks run, and the same stream
/// cannot be resumed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("malformed varint")]
    MalformedVarint,
    #[error("invalid wire type {0}")]
    BadWireType(u8),
    #[error("invalid field number {0}")]
    BadFieldNumber(u64),
    #[error("declared length overflows the enclosing region")]
    LengthOverflow,
    #[error("end-group tag with no matching open group")]
    UnbalancedGroup,
    #[error("message nesting exceeds the decoder stack depth")]
    NestingTooDeep,
    #[error("handler for selector {selector} returned failure")]
    Handler { selector: Selector },
    #[error("input ended inside an incomplete element")]
    Truncated,
}

/// Sticky status of a decode pipeline.
///
/// Records the first failure; every later sink or decoder operation
/// short-circuits until the pipeline is reset.
#[derive(Debug, Default)]
pub struct PipelineStatus {
    err: Option<Error>,
}

impl PipelineStatus {
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub(crate) fn fail(&mut self, err: Error) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.err = None;
    }
}

/// Failures from building or freezing defs and handler tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefError {
    #[error("field number {number} already used in message {message}")]
    DuplicateFieldNumber { message: String, number: u32 },
    #[error("name {name:?} already used in {scope}")]
    NameCollision { scope: String, name: String },
    #[error("field number {0} out of range")]
    FieldNumberOutOfRange(u32),
    #[error("field {field} needs a sub-def but none was linked")]
    MissingSubDef { field: String },
    #[error("symbol {0:?} does not name a def in this pool")]
    UnresolvedSymbol(String),
    #[error("sub-def of field {field} has the wrong def kind")]
    SubDefKind { field: String },
    #[error("default value of field {field} does not match its type")]
    BadDefault { field: String },
    #[error("cycle through required fields involving message {0}")]
    RequiredCycle(String),
    #[error("defs are frozen and can no longer be mutated")]
    Frozen,
    #[error("handler type does not match field {field}")]
    HandlerType { field: String },
    #[error("field {field} does not reserve that handler kind")]
    HandlerKind { field: String },
    #[error("sub-handlers are for a different message than field {field}")]
    SubHandlersMismatch { field: String },
}
