//! Handlers for functions with a non-empty link name. These bypass MIR
//! dispatch entirely; anything not in the table is fatal.

use crate::ty::POINTER_SIZE;
use crate::value::Value;
use anyhow::{bail, Result};
use tracing::debug;

pub(super) fn invoke_extern(link_name: &str, abi: &str, _args: Vec<Value>) -> Result<Value> {
    match link_name {
        "AddVectoredExceptionHandler" => {
            debug!("extern `AddVectoredExceptionHandler` ({abi}): ignoring, returning non-null");
            let mut rv = Value::zeroed(POINTER_SIZE);
            rv.write_usize(0, 1)?;
            Ok(rv)
        }
        _ => bail!("extern function `{link_name}` (abi {abi}) is not supported"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_registration_is_ignored() {
        let rv = invoke_extern("AddVectoredExceptionHandler", "system", vec![]).unwrap();
        assert_eq!(rv.read_usize(0).unwrap(), 1);
    }

    #[test]
    fn unknown_link_name_is_fatal() {
        assert!(invoke_extern("gettimeofday", "C", vec![]).is_err());
    }
}
