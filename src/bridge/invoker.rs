//! Native Call Invoker
//!
//! Invokes the opaque signing function at a computed address and marshals
//! its output buffers back into owned memory. The argument layout is the
//! one observed on the target module: the callee writes into a
//! caller-provided scratch buffer split into fixed-size slots, one per
//! result field, with each slot's payload length in its final byte.
//!
//! The callable is capability-typed (`CallTarget`) rather than hard-linked,
//! and the buffer layout is data (`CallContract`), so both can be swapped
//! when the real module's ABI turns out to differ, and a stub can stand in
//! for the module under test.

use std::ffi::{c_char, c_int, CStr, CString};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BridgeError, BridgeResult};

/// Raw signature of the opaque signing entry point.
///
/// `(cmd, payload, payload_len, seq, out) -> status`, zero on success.
pub type RawSignFn =
    unsafe extern "C" fn(*const c_char, *const u8, c_int, c_int, *mut u8) -> c_int;

/// Default scratch-buffer capacity expected by the target module.
pub const DEFAULT_OUT_CAPACITY: usize = 0x300;
/// Default per-result slot size.
pub const DEFAULT_SLOT_SIZE: usize = 0x100;
/// Default bound on waiting for the foreign-call lock.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Output-buffer layout contract for the foreign call.
///
/// Three result slots (token, extra, signature) of `slot_size` bytes each;
/// a slot's payload occupies its leading bytes and the payload length sits
/// in the slot's final byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContract {
    /// Total scratch-buffer capacity handed to the callee.
    pub out_capacity: usize,
    /// Size of each result slot.
    pub slot_size: usize,
}

impl CallContract {
    const SLOTS: usize = 3;

    /// Check the layout is internally consistent.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.slot_size < 2 {
            return Err(BridgeError::ContractInvalid(format!(
                "slot size {} too small",
                self.slot_size
            )));
        }
        if self.out_capacity != self.slot_size * Self::SLOTS {
            return Err(BridgeError::ContractInvalid(format!(
                "capacity {:#x} does not hold {} slots of {:#x}",
                self.out_capacity,
                Self::SLOTS,
                self.slot_size
            )));
        }
        Ok(())
    }

    /// Maximum payload bytes a slot can carry.
    pub fn slot_data_capacity(&self) -> usize {
        self.slot_size - 1
    }

    /// Extract the three result buffers from a filled scratch buffer,
    /// copying each into owned memory. Partial output (an empty slot) or a
    /// length past the slot's data capacity fails the whole call; nothing
    /// is returned in that case.
    fn extract(&self, out: &[u8]) -> BridgeResult<SignOutput> {
        Ok(SignOutput {
            token: self.slot_field(out, 0)?,
            extra: self.slot_field(out, 1)?,
            signature: self.slot_field(out, 2)?,
        })
    }

    fn slot_field(&self, out: &[u8], slot: usize) -> BridgeResult<Vec<u8>> {
        let start = slot * self.slot_size;
        let data = &out[start..start + self.slot_size];
        let len = data[self.slot_size - 1] as usize;
        if len == 0 {
            return Err(BridgeError::NativeCall(format!(
                "partial result: slot {} is empty",
                slot
            )));
        }
        if len > self.slot_data_capacity() {
            return Err(BridgeError::NativeCall(format!(
                "slot {} length {} exceeds capacity {}",
                slot,
                len,
                self.slot_data_capacity()
            )));
        }
        Ok(data[..len].to_vec())
    }
}

impl Default for CallContract {
    fn default() -> Self {
        Self {
            out_capacity: DEFAULT_OUT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

/// The three result buffers of a successful sign call, independently owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutput {
    /// Session/token material.
    pub token: Vec<u8>,
    /// Auxiliary data the module returns alongside the signature.
    pub extra: Vec<u8>,
    /// The signature proper.
    pub signature: Vec<u8>,
}

/// The opaque signing callable.
///
/// `NativeTarget` adapts a computed address; tests implement this directly
/// to stand in for the module.
pub trait CallTarget: Send + Sync {
    /// Execute the foreign call. `out` is zeroed and sized per the
    /// contract. Returns the callee's status code, zero on success.
    fn call(&self, cmd: &CStr, payload: &[u8], seq: i32, out: &mut [u8]) -> i32;
}

/// A `CallTarget` backed by a raw function pointer at a computed address.
pub struct NativeTarget {
    func: RawSignFn,
}

impl NativeTarget {
    /// Build a target from an absolute address.
    ///
    /// # Safety
    ///
    /// `address` must be the entry point of a function with the `RawSignFn`
    /// signature and C calling convention, and the library mapping it must
    /// outlive this target. Both are the lifecycle manager's responsibility.
    pub unsafe fn from_address(address: usize) -> Self {
        Self {
            func: std::mem::transmute::<usize, RawSignFn>(address),
        }
    }
}

impl CallTarget for NativeTarget {
    fn call(&self, cmd: &CStr, payload: &[u8], seq: i32, out: &mut [u8]) -> i32 {
        unsafe {
            (self.func)(
                cmd.as_ptr(),
                payload.as_ptr(),
                payload.len() as c_int,
                seq,
                out.as_mut_ptr(),
            )
        }
    }
}

/// Serializing invoker around a single `CallTarget`.
///
/// The opaque module's re-entrancy is unknown, so every foreign call runs
/// under one mutex. Waiters are bounded by `call_timeout`; a call already
/// issued is never abandoned.
pub struct NativeInvoker {
    target: Box<dyn CallTarget>,
    contract: CallContract,
    call_timeout: Duration,
    gate: Mutex<()>,
}

impl NativeInvoker {
    /// Create an invoker. Fails if the contract is inconsistent.
    pub fn new(
        target: Box<dyn CallTarget>,
        contract: CallContract,
        call_timeout: Duration,
    ) -> BridgeResult<Self> {
        contract.validate()?;
        Ok(Self {
            target,
            contract,
            call_timeout,
            gate: Mutex::new(()),
        })
    }

    /// The contract this invoker marshals under.
    pub fn contract(&self) -> &CallContract {
        &self.contract
    }

    /// Invoke the foreign function once. Inputs are validated before the
    /// call; outputs are copied into owned buffers before the scratch
    /// buffer is released. No internal retry: a failed call surfaces
    /// immediately, since the module's state after a failure is unknown.
    pub fn invoke(&self, cmd: &str, payload: &[u8], seq: u32) -> BridgeResult<SignOutput> {
        let cmd = CString::new(cmd)
            .map_err(|_| BridgeError::InvalidInput("cmd contains an interior NUL".into()))?;
        if payload.len() > c_int::MAX as usize {
            return Err(BridgeError::InvalidInput(format!(
                "payload of {} bytes exceeds native length range",
                payload.len()
            )));
        }
        let seq = i32::try_from(seq)
            .map_err(|_| BridgeError::InvalidInput(format!("seq {} exceeds native range", seq)))?;

        let mut out = vec![0u8; self.contract.out_capacity];

        let guard = self
            .gate
            .try_lock_for(self.call_timeout)
            .ok_or(BridgeError::CallTimeout(self.call_timeout))?;
        trace!(seq, payload_len = payload.len(), "entering foreign call");
        let status = self.target.call(&cmd, payload, seq, &mut out);
        drop(guard);

        if status != 0 {
            debug!(status, "foreign call reported failure");
            return Err(BridgeError::NativeCall(format!(
                "target returned status {}",
                status
            )));
        }

        self.contract.extract(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes fixed bytes into each slot.
    struct FixedStub {
        token: Vec<u8>,
        extra: Vec<u8>,
        signature: Vec<u8>,
        status: i32,
    }

    impl FixedStub {
        fn ok(token: &[u8], extra: &[u8], signature: &[u8]) -> Self {
            Self {
                token: token.to_vec(),
                extra: extra.to_vec(),
                signature: signature.to_vec(),
                status: 0,
            }
        }
    }

    impl CallTarget for FixedStub {
        fn call(&self, _cmd: &CStr, _payload: &[u8], _seq: i32, out: &mut [u8]) -> i32 {
            let contract = CallContract::default();
            for (slot, data) in [&self.token, &self.extra, &self.signature]
                .into_iter()
                .enumerate()
            {
                let start = slot * contract.slot_size;
                out[start..start + data.len()].copy_from_slice(data);
                out[start + contract.slot_size - 1] = data.len() as u8;
            }
            self.status
        }
    }

    fn invoker(target: impl CallTarget + 'static) -> NativeInvoker {
        NativeInvoker::new(
            Box::new(target),
            CallContract::default(),
            DEFAULT_CALL_TIMEOUT,
        )
        .unwrap()
    }

    #[test]
    fn test_invoke_copies_all_slots() {
        let inv = invoker(FixedStub::ok(&[0xAA], &[0xBB, 0xBB], &[0xCC; 64]));
        let out = inv.invoke("cmd1", &[0x01, 0x02], 7).unwrap();
        assert_eq!(out.token, vec![0xAA]);
        assert_eq!(out.extra, vec![0xBB, 0xBB]);
        assert_eq!(out.signature, vec![0xCC; 64]);
    }

    #[test]
    fn test_nonzero_status_is_native_call_error() {
        let mut stub = FixedStub::ok(&[1], &[2], &[3]);
        stub.status = -5;
        let inv = invoker(stub);
        match inv.invoke("cmd", &[], 0) {
            Err(BridgeError::NativeCall(msg)) => assert!(msg.contains("-5")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_partial_output_discards_everything() {
        // Signature slot left empty: the whole call fails.
        struct Partial;
        impl CallTarget for Partial {
            fn call(&self, _cmd: &CStr, _payload: &[u8], _seq: i32, out: &mut [u8]) -> i32 {
                out[0] = 0xAA;
                out[0xFF] = 1;
                out[0x100] = 0xBB;
                out[0x1FF] = 1;
                0
            }
        }
        let inv = invoker(Partial);
        assert!(matches!(
            inv.invoke("cmd", &[], 0),
            Err(BridgeError::NativeCall(_))
        ));
    }

    #[test]
    fn test_invalid_inputs_never_reach_target() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counting(Arc<AtomicUsize>);
        impl CallTarget for Counting {
            fn call(&self, _cmd: &CStr, _payload: &[u8], _seq: i32, _out: &mut [u8]) -> i32 {
                self.0.fetch_add(1, Ordering::SeqCst);
                1
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let inv = invoker(Counting(calls.clone()));

        assert!(matches!(
            inv.invoke("bad\0cmd", &[], 0),
            Err(BridgeError::InvalidInput(_))
        ));
        assert!(matches!(
            inv.invoke("cmd", &[], u32::MAX),
            Err(BridgeError::InvalidInput(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_contract_validation() {
        assert!(CallContract::default().validate().is_ok());
        assert!(CallContract {
            out_capacity: 0x300,
            slot_size: 0x80,
        }
        .validate()
        .is_err());
        assert!(CallContract {
            out_capacity: 3,
            slot_size: 1,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_slot_length_beyond_capacity_rejected() {
        // A length byte of 0xFF is the maximum legal value under the
        // default contract, so shrink the slots to force the rejection
        // path.
        let contract = CallContract {
            out_capacity: 0x30,
            slot_size: 0x10,
        };
        struct Claim16;
        impl CallTarget for Claim16 {
            fn call(&self, _cmd: &CStr, _payload: &[u8], _seq: i32, out: &mut [u8]) -> i32 {
                out[0x0F] = 16; // data capacity is 15
                out[0x1F] = 1;
                out[0x2F] = 1;
                0
            }
        }
        let inv = NativeInvoker::new(Box::new(Claim16), contract, DEFAULT_CALL_TIMEOUT).unwrap();
        assert!(matches!(
            inv.invoke("cmd", &[], 0),
            Err(BridgeError::NativeCall(_))
        ));
    }

    #[test]
    fn test_call_timeout_distinct_from_failure() {
        use std::thread;

        struct Slow;
        impl CallTarget for Slow {
            fn call(&self, _cmd: &CStr, _payload: &[u8], _seq: i32, out: &mut [u8]) -> i32 {
                thread::sleep(Duration::from_millis(300));
                out[0xFF] = 1;
                out[0x1FF] = 1;
                out[0x2FF] = 1;
                out[0] = 1;
                out[0x100] = 1;
                out[0x200] = 1;
                0
            }
        }

        let inv = std::sync::Arc::new(
            NativeInvoker::new(
                Box::new(Slow),
                CallContract::default(),
                Duration::from_millis(50),
            )
            .unwrap(),
        );

        let first = {
            let inv = inv.clone();
            thread::spawn(move || inv.invoke("cmd", &[], 1))
        };
        // Give the first call time to take the gate.
        thread::sleep(Duration::from_millis(100));
        let second = inv.invoke("cmd", &[], 2);

        assert!(matches!(second, Err(BridgeError::CallTimeout(_))));
        assert!(first.join().unwrap().is_ok());
    }
}
