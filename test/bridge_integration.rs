//! End-to-end bridge tests against stub call targets
//!
//! These tests exercise the full lifecycle → invoker → codec path with the
//! opaque module replaced by in-process stubs, including the concurrency
//! guarantee that each caller gets only its own output triple.

use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use offsign::bridge::{
    BridgeConfig, BridgeError, CallTarget, ModuleState, SignModule, DEFAULT_SLOT_SIZE,
};
use offsign::codec::{SignReply, SignRequest};

fn stub_config() -> BridgeConfig {
    BridgeConfig::new(Vec::new(), 0)
}

/// Stub returning fixed single-byte buffers for any input.
struct FixedStub;

impl CallTarget for FixedStub {
    fn call(&self, _cmd: &CStr, _payload: &[u8], _seq: i32, out: &mut [u8]) -> i32 {
        for (slot, byte) in [0xAAu8, 0xBB, 0xCC].into_iter().enumerate() {
            let start = slot * DEFAULT_SLOT_SIZE;
            out[start] = byte;
            out[start + DEFAULT_SLOT_SIZE - 1] = 1;
        }
        0
    }
}

/// Stub that derives every output byte from the caller's input, so crossed
/// buffers between concurrent callers are detectable.
struct TaggingStub;

impl CallTarget for TaggingStub {
    fn call(&self, _cmd: &CStr, payload: &[u8], seq: i32, out: &mut [u8]) -> i32 {
        // Widen the race window a little.
        thread::yield_now();
        let seq_bytes = seq.to_le_bytes();
        for slot in 0..3u8 {
            let start = slot as usize * DEFAULT_SLOT_SIZE;
            let data = &mut out[start..start + DEFAULT_SLOT_SIZE];
            data[0] = payload[0];
            data[1] = slot;
            data[2..6].copy_from_slice(&seq_bytes);
            data[DEFAULT_SLOT_SIZE - 1] = 6;
        }
        0
    }
}

/// Stub that counts how often the native side was entered.
struct CountingStub(Arc<AtomicUsize>);

impl CallTarget for CountingStub {
    fn call(&self, _cmd: &CStr, _payload: &[u8], _seq: i32, out: &mut [u8]) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst);
        FixedStub.call(_cmd, _payload, _seq, out)
    }
}

#[test]
fn test_fixed_buffer_scenario() {
    let module = SignModule::with_target(stub_config(), Box::new(FixedStub)).unwrap();
    let output = module.sign("cmd1", &[0x01, 0x02], 7).unwrap();

    assert_eq!(output.token, vec![0xAA]);
    assert_eq!(output.extra, vec![0xBB]);
    assert_eq!(output.signature, vec![0xCC]);

    // The encoding boundary introduces no corruption.
    let reply = SignReply::from_output(&output);
    assert_eq!(reply.token, "AA");
    assert_eq!(reply.extra, "BB");
    assert_eq!(reply.sign, "CC");
    assert_eq!(reply.decode().unwrap(), output);
}

#[test]
fn test_request_decode_feeds_sign() {
    let module = SignModule::with_target(stub_config(), Box::new(FixedStub)).unwrap();
    let request = SignRequest {
        cmd: "cmd1".to_string(),
        src: "0102".to_string(),
        seq: 7,
    };
    let payload = request.decode_payload().unwrap();
    assert_eq!(payload, vec![0x01, 0x02]);

    let output = module.sign(&request.cmd, &payload, request.seq).unwrap();
    assert_eq!(output.token, vec![0xAA]);
}

#[test]
fn test_invalid_hex_never_reaches_native_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let module =
        SignModule::with_target(stub_config(), Box::new(CountingStub(calls.clone()))).unwrap();

    let request = SignRequest {
        cmd: "cmd1".to_string(),
        src: "not-hex!".to_string(),
        seq: 1,
    };
    let err = request.decode_payload().unwrap_err();
    assert!(matches!(err, BridgeError::InvalidInput(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A valid request afterwards still works.
    let ok = SignRequest {
        cmd: "cmd1".to_string(),
        src: "FF".to_string(),
        seq: 1,
    };
    module
        .sign(&ok.cmd, &ok.decode_payload().unwrap(), ok.seq)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sign_before_initialize_fails_without_native_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let module =
        SignModule::with_target(stub_config(), Box::new(CountingStub(calls.clone()))).unwrap();
    module.unload();

    for _ in 0..3 {
        assert!(matches!(
            module.sign("cmd", &[1], 0),
            Err(BridgeError::NotInitialized)
        ));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_teardown_is_idempotent() {
    let module = SignModule::with_target(stub_config(), Box::new(FixedStub)).unwrap();
    assert_eq!(module.state(), ModuleState::Ready);

    module.unload();
    assert_eq!(module.state(), ModuleState::Uninitialized);
    module.unload();
    assert_eq!(module.state(), ModuleState::Uninitialized);
}

#[test]
fn test_concurrent_signs_do_not_interleave() {
    const THREADS: usize = 8;
    const CALLS_PER_THREAD: usize = 32;

    let module = Arc::new(SignModule::with_target(stub_config(), Box::new(TaggingStub)).unwrap());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let module = module.clone();
        handles.push(thread::spawn(move || {
            for call in 0..CALLS_PER_THREAD {
                let seq = (t * CALLS_PER_THREAD + call) as u32;
                let tag = (t as u8) ^ 0x40;
                let payload = [tag, 0, 0, 0];
                let output = module.sign("cmd", &payload, seq).unwrap();

                let seq_bytes = (seq as i32).to_le_bytes();
                for (slot, buf) in [&output.token, &output.extra, &output.signature]
                    .into_iter()
                    .enumerate()
                {
                    assert_eq!(buf.len(), 6);
                    assert_eq!(buf[0], tag, "foreign caller tag crossed threads");
                    assert_eq!(buf[1], slot as u8);
                    assert_eq!(&buf[2..6], &seq_bytes, "seq crossed threads");
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_unload_waits_for_inflight_then_rejects() {
    let module = Arc::new(SignModule::with_target(stub_config(), Box::new(TaggingStub)).unwrap());

    let signer = {
        let module = module.clone();
        thread::spawn(move || {
            let mut accepted = 0usize;
            for seq in 0..64u32 {
                match module.sign("cmd", &[1, 0, 0, 0], seq) {
                    Ok(_) => accepted += 1,
                    Err(BridgeError::NotInitialized) => break,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            accepted
        })
    };

    thread::yield_now();
    module.unload();
    assert_eq!(module.state(), ModuleState::Uninitialized);

    // Whatever completed before the unload completed cleanly; everything
    // after is rejected, never torn.
    let _accepted = signer.join().unwrap();
    assert!(matches!(
        module.sign("cmd", &[1, 0, 0, 0], 0),
        Err(BridgeError::NotInitialized)
    ));
}
