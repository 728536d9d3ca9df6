//! Built-in op registrations.

mod matmul;
mod pad;
mod reduce;
mod relu;

use crate::error::Result;
use crate::registry::OpRegistry;

/// Register every built-in op type into `registry`.
pub fn register_builtin(registry: &mut OpRegistry) -> Result<()> {
    pad::register(registry)?;
    relu::register(registry)?;
    matmul::register(registry)?;
    reduce::register(registry)?;
    Ok(())
}
