//! Built-in plugins. Each file exposes a `SPEC` registration table that the
//! build-time metadata extractor reads as plain literals.

pub mod direct;

use crate::{common::PipeResult, session::Session};

pub fn register_builtin(session: &mut Session) -> PipeResult<()> {
    session.register(Box::new(direct::DirectPlugin))?;
    Ok(())
}
