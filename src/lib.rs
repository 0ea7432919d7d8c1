//! Offsign - Offset-Addressed Native Signing Bridge
//!
//! A signing service whose cryptographic core is a closed, externally
//! supplied native module. The entry point is not exported by symbol; it is
//! reached by adding a configured offset to the load base of whichever
//! configured library is actually mapped into the process.
//!
//! This crate is the bridge between an HTTP API layer (an external
//! collaborator) and that foreign entry point:
//!
//! - **Library resolution**: ordered candidates, already-resident images
//!   preferred, base address and mapped extent discovered from the loader.
//! - **Offset arithmetic**: a configuration-time expression evaluated once,
//!   then `base + offset` with bounds validation where metadata allows.
//! - **Invocation**: the C-ABI foreign call under a fixed marshalling
//!   contract, serialized because the module's re-entrancy is unknown.
//! - **Lifecycle**: an explicit `Uninitialized → Ready` state machine with
//!   idempotent teardown; no ambient global state.
//!
//! # Example
//!
//! ```no_run
//! use offsign::bridge::{BridgeConfig, LibrarySpec, SignModule};
//!
//! let config = BridgeConfig::new(
//!     vec![LibrarySpec::new("libgnutls.so.30"), LibrarySpec::new("./libsymbols.so")],
//!     0x1a2b40,
//! );
//! let module = SignModule::new(config);
//! module.load()?;
//! let output = module.sign("cmd1", &[0x01, 0x02], 7)?;
//! println!("signature: {}", hex::encode_upper(&output.signature));
//! module.unload();
//! # Ok::<(), offsign::bridge::BridgeError>(())
//! ```
//!
//! The foreign call is a memory-safety boundary. Everything crossing it is
//! copied: request payloads into bridge-owned buffers before the call,
//! result slots into owned `Vec`s before the scratch buffer is released. A
//! fault inside the opaque module (a wrong offset, a corrupted image) is
//! not recoverable in-process; deployments needing containment run the
//! bridge in its own process.

#![warn(clippy::all)]

pub mod bridge;
pub mod codec;
pub mod config;

// Re-export commonly used types
pub use bridge::{
    BridgeConfig, BridgeError, BridgeResult, CallContract, CallTarget, LibrarySpec, ModuleState,
    OffsetExpr, SignModule, SignOutput,
};
pub use codec::{SignReply, SignRequest};
pub use config::{ConfigError, ConfigResult, OffsignConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_reexports() {
        // The API layer programs against the crate root.
        let _state: ModuleState = ModuleState::Uninitialized;
        let _contract = CallContract::default();
        assert!(!VERSION.is_empty());
    }
}
