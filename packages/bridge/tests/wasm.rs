//! The Wasmtime-backed sandbox against a small hand-written runtime module.

use sandlink_bridge::{Bridge, BridgeConfig, Error, Result, Sandbox, SuspendState, Value, WasmSandbox};
use wasmtime::Engine;

/// A minimal runtime: a bump allocator, one built-in `add` function,
/// host-backed functions and the error channel.
///
/// Objects start with a kind word: `1` is a host-backed function whose
/// resource id follows, `2` is the built-in adder at address 16.
const RUNTIME_WAT: &str = r#"
(module
  (import "env" "sandlink_host_call" (func $host_call (param i32 i32 i32 i32) (result i32)))
  (import "env" "sandlink_host_release" (func $host_release (param i32)))

  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 4096))

  (data (i32.const 16) "\02\00\00\00")
  (data (i32.const 48) "\0a\00\00\00ValueError")
  (data (i32.const 64) "\0f\00\00\00expected 2 args")

  (func $alloc (export "sandlink_alloc") (param $n i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap
      (i32.add (global.get $heap)
        (i32.and (i32.add (local.get $n) (i32.const 15)) (i32.const -16))))
    (local.get $p))

  (func (export "sandlink_free") (param i32))

  (func (export "sandlink_object_retain") (param i32))

  (func (export "sandlink_object_free") (param $h i32) (result i32)
    (if (i32.eq (i32.load (local.get $h)) (i32.const 1))
      (then (call $host_release (i32.load offset=4 (local.get $h)))))
    (i32.const 0))

  (func (export "sandlink_func_create_from_host") (param $resource i32) (param $out i32) (result i32)
    (local $obj i32)
    (local.set $obj (call $alloc (i32.const 8)))
    (i32.store (local.get $obj) (i32.const 1))
    (i32.store offset=4 (local.get $obj) (local.get $resource))
    (i32.store (local.get $out) (local.get $obj))
    (i32.const 0))

  ;; Only "add" exists.
  (func (export "sandlink_get_global_func") (param $name i32) (param $out i32) (result i32)
    (i32.store (local.get $out)
      (select (i32.const 16) (i32.const 0)
        (i32.and
          (i32.eq (i32.load (local.get $name)) (i32.const 3))
          (i32.and
            (i32.eq (i32.load16_u offset=4 (local.get $name)) (i32.const 0x6461))
            (i32.eq (i32.load8_u offset=6 (local.get $name)) (i32.const 0x64))))))
    (i32.const 0))

  (func (export "sandlink_register_global_func") (param i32 i32 i32) (result i32)
    (i32.const 0))

  (func (export "sandlink_func_call") (param $f i32) (param $args i32) (param $nargs i32) (param $ret i32) (result i32)
    (if (i32.eq (i32.load (local.get $f)) (i32.const 1))
      (then
        (return (call $host_call
          (i32.load offset=4 (local.get $f)) (local.get $args) (local.get $nargs) (local.get $ret)))))
    (if (i32.ne (local.get $nargs) (i32.const 2))
      (then
        (i32.store (i32.const 32) (i32.const 48))
        (i32.store (i32.const 36) (i32.const 64))
        (return (i32.const -1))))
    (i32.store (local.get $ret) (i32.const 1))
    (i32.store offset=4 (local.get $ret) (i32.const 0))
    (i64.store offset=8 (local.get $ret)
      (i64.add (i64.load offset=8 (local.get $args)) (i64.load offset=24 (local.get $args))))
    (i32.const 0))

  (func (export "sandlink_set_return") (param $ret i32) (param $value i32) (result i32)
    (i64.store (local.get $ret) (i64.load (local.get $value)))
    (i64.store offset=8 (local.get $ret) (i64.load offset=8 (local.get $value)))
    (i32.const 0))

  (func $copy (param $s i32) (result i32)
    (local $n i32)
    (local $p i32)
    (local.set $n (i32.add (i32.load (local.get $s)) (i32.const 4)))
    (local.set $p (call $alloc (local.get $n)))
    (memory.copy (local.get $p) (local.get $s) (local.get $n))
    (local.get $p))

  (func (export "sandlink_set_last_error") (param $kind i32) (param $msg i32)
    (i32.store (i32.const 32) (call $copy (local.get $kind)))
    (i32.store (i32.const 36) (call $copy (local.get $msg))))

  (func (export "sandlink_last_error") (result i32)
    (i32.const 32))
)
"#;

fn sandbox() -> WasmSandbox {
    WasmSandbox::new(&Engine::default(), RUNTIME_WAT, BridgeConfig::default()).unwrap()
}

#[test]
fn calls_a_module_function() {
    let mut sandbox = sandbox();
    assert_eq!(
        sandbox.call("add", &[Value::Int(40), Value::Int(2)]).unwrap(),
        Value::Int(42)
    );
    assert_eq!(sandbox.state().arena().in_flight(), 0);
    assert_eq!(sandbox.suspend_state().unwrap(), SuspendState::Normal);
}

#[test]
fn module_errors_keep_kind_and_message() {
    let mut sandbox = sandbox();
    assert_eq!(
        sandbox.call("add", &[Value::Int(1)]),
        Err(Error::ForeignError {
            kind: "ValueError".to_string(),
            message: "expected 2 args".to_string(),
        })
    );
}

#[test]
fn unknown_names_are_not_found() {
    let mut sandbox = sandbox();
    sandbox.begin_scope();
    assert_eq!(
        sandbox.lookup("nope"),
        Err(Error::SymbolNotFound("nope".to_string()))
    );
    sandbox.end_scope().unwrap();
}

#[test]
fn host_functions_are_called_back_through_the_module() {
    let mut sandbox = sandbox();
    sandbox.begin_scope();
    let add1 = sandbox
        .to_packed_func(|_: &mut dyn Sandbox, args: &[Value]| -> Result<Value> {
            Ok(Value::Int(args[0].as_i64()? + 1))
        })
        .unwrap();
    assert_eq!(sandbox.state().live_callbacks(), 1);
    assert_eq!(sandbox.invoke(&add1, &[Value::Int(41)]).unwrap(), Value::Int(42));

    sandbox.end_scope().unwrap();
    assert_eq!(sandbox.state().live_callbacks(), 0);
}

#[test]
fn host_failures_cross_the_module_as_callback_errors() {
    let mut sandbox = sandbox();
    sandbox.begin_scope();
    let failing = sandbox
        .to_packed_func(|_: &mut dyn Sandbox, _: &[Value]| -> Result<Value> {
            Err(Error::CallbackError {
                message: "host said no".to_string(),
            })
        })
        .unwrap();
    assert_eq!(
        sandbox.invoke(&failing, &[]),
        Err(Error::CallbackError {
            message: "host said no".to_string()
        })
    );
    sandbox.end_scope().unwrap();
}

#[test]
fn modules_without_asyncify_cannot_suspend() {
    let mut sandbox = sandbox();
    assert_eq!(
        sandbox.start_unwind(),
        Err(Error::SuspensionUnsupported("start_unwind".to_string()))
    );
}
