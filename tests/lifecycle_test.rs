mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use common::{DropCounter, StrengthRecorder, handle_strength, spawn_context};
use lifecycle_bridge::{
    ContextConfig, LifecycleError, LifecycleObject, LifecycleState, RuntimeContext, Strength,
    StrengthChange, WeakObject,
};
use parking_lot::Mutex;

/// Poll `done` until it holds or a few seconds passed.
fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }

    true
}

#[test]
fn test_unmirrored_object_destroyed_on_unref() {
    let (payload, drops) = DropCounter::new();
    let object = LifecycleObject::new(payload);

    assert_eq!(object.ref_count(), 1);
    assert!(!object.is_mirrored());
    assert!(object.context().is_none());

    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unref_on_owning_thread_weakens_then_finalizes() {
    let recorder = StrengthRecorder::default();
    let context = recorder.spawn_context("unref-on-thread");
    let owner_thread = context.owning_thread().unwrap();

    let (payload, drops) = DropCounter::new();
    let object = LifecycleObject::new(payload);

    let (handle, weakened, finalized, ledger) = context
        .run_sync(move |scope| {
            let script_ref = scope.wrap(&object).unwrap();
            let handle = script_ref.handle();
            drop(script_ref);

            // Last native owner, on the owning thread
            drop(object);
            let weakened = scope.strength(handle);

            let finalized = scope.collect_garbage();
            (handle, weakened, finalized, scope.external_memory())
        })
        .unwrap();

    assert_eq!(weakened, Strength::Weak);
    assert_eq!(finalized, 1);
    assert_eq!(ledger, 0);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    assert_eq!(
        recorder.changes_of(handle),
        vec![
            (Strength::Empty, Strength::Strong),
            (Strength::Strong, Strength::Weak),
            (Strength::Weak, Strength::Empty),
        ]
    );
    assert_eq!(recorder.foreign_changes(context.id(), owner_thread), 0);

    context.shutdown().unwrap();
}

#[test]
fn test_unref_off_thread_is_handed_off() {
    let recorder = StrengthRecorder::default();
    let context = recorder.spawn_context("unref-off-thread");
    let owner_thread = context.owning_thread().unwrap();

    let (payload, drops) = DropCounter::new();
    let object = LifecycleObject::new(payload);
    let weak = object.downgrade();

    let owner = object.clone();
    let handle = context
        .run_sync(move |scope| scope.wrap(&owner).unwrap().handle())
        .unwrap();

    assert_eq!(object.ref_count(), 1);
    assert_eq!(handle_strength(&context, handle), Strength::Strong);

    // Last owner dropped on another thread
    std::thread::spawn(move || drop(object)).join().unwrap();

    // The weakening already ran on the owning thread when drop returned
    let changes = recorder.changes();
    let last = changes.last().unwrap();
    assert_eq!(last.handle, handle);
    assert_eq!((last.from, last.to), (Strength::Strong, Strength::Weak));
    assert_eq!(last.thread, owner_thread);

    // Not destroyed by Unref: the collector owns it now
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(handle_strength(&context, handle), Strength::Weak);

    let finalized = context.run_sync(|scope| scope.collect_garbage()).unwrap();
    assert_eq!(finalized, 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(weak.upgrade().is_none());

    assert_eq!(recorder.foreign_changes(context.id(), owner_thread), 0);
    context.shutdown().unwrap();
}

#[test]
fn test_ref_from_zero_strengthens_before_returning() {
    let context = spawn_context("ref-from-zero");

    let object = LifecycleObject::new(11u32);
    let weak = object.downgrade();

    let owner = object.clone();
    let handle = context
        .run_sync(move |scope| scope.wrap(&owner).unwrap().handle())
        .unwrap();

    drop(object);
    assert_eq!(handle_strength(&context, handle), Strength::Weak);

    // 0 -> 1 from a thread that does not own the context
    let revived = weak.upgrade().unwrap();
    assert_eq!(revived.ref_count(), 1);
    assert_eq!(revived.state(), LifecycleState::MirroredStrong);
    assert_eq!(handle_strength(&context, handle), Strength::Strong);

    // Strong mirrors survive collection
    let finalized = context.run_sync(|scope| scope.collect_garbage()).unwrap();
    assert_eq!(finalized, 0);
    assert_eq!(*revived, 11);

    drop(revived);
    context.shutdown().unwrap();
}

#[test]
fn test_script_ref_object_revives_weak_mirror() {
    let context = spawn_context("script-object");

    let outcome = context
        .run_sync(|scope| {
            let object = LifecycleObject::new(String::from("payload"));
            let script_ref = scope.wrap(&object).unwrap();
            drop(object);

            let weakened = script_ref.strength();
            let revived = script_ref.object::<String>().unwrap();
            let strengthened = script_ref.strength();
            let wrong_type = script_ref.object::<u32>().is_none();

            (weakened, strengthened, revived.as_str() == "payload", wrong_type)
        })
        .unwrap();

    assert_eq!(outcome, (Strength::Weak, Strength::Strong, true, true));

    // The revived owner was dropped at the end of the task
    let finalized = context.run_sync(|scope| scope.collect_garbage()).unwrap();
    assert_eq!(finalized, 1);

    context.shutdown().unwrap();
}

#[test]
fn test_wrap_twice_reuses_mirror() {
    let context = spawn_context("rewrap");
    let object = LifecycleObject::new(());

    let owner = object.clone();
    let (first, second, script_refs) = context
        .run_sync(move |scope| {
            let a = scope.wrap(&owner).unwrap();
            let b = scope.wrap(&owner).unwrap();
            (a.handle(), b.handle(), scope.stats().script_refs)
        })
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(script_refs, 2);
    assert_eq!(object.mirror(), Some(first));

    drop(object);
    context.shutdown().unwrap();
}

#[test]
fn test_wrap_in_other_context_is_rejected() {
    let first = spawn_context("holder");
    let second = spawn_context("intruder");

    let object = LifecycleObject::new(());

    let owner = object.clone();
    first
        .run_sync(move |scope| scope.wrap(&owner).map(|_| ()))
        .unwrap()
        .unwrap();

    let owner = object.clone();
    let result = second
        .run_sync(move |scope| scope.wrap(&owner).map(|_| ()))
        .unwrap();

    assert_eq!(
        result,
        Err(LifecycleError::WrongContext {
            bound: first.id(),
            current: second.id(),
        })
    );
    assert!(lifecycle_bridge::RuntimeContext::ptr_eq(object.context().unwrap(), &first));

    drop(object);
    first.shutdown().unwrap();
    second.shutdown().unwrap();
}

#[test]
fn test_dispose_off_thread_releases_mirror() {
    let context = spawn_context("dispose");
    let (payload, drops) = DropCounter::new();
    let object = LifecycleObject::new(payload);

    let owner = object.clone();
    let handle = context
        .run_sync(move |scope| scope.wrap(&owner).unwrap().handle())
        .unwrap();
    assert!(context.external_memory() > 0);

    object.dispose().unwrap();
    object.dispose().unwrap();

    assert_eq!(object.state(), LifecycleState::Unmirrored);
    assert_eq!(object.mirror(), None);
    assert_eq!(handle_strength(&context, handle), Strength::Empty);
    assert_eq!(context.external_memory(), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    // Same context, fresh mirror
    let owner = object.clone();
    let rewrapped = context
        .run_sync(move |scope| scope.wrap(&owner).unwrap().handle())
        .unwrap();
    assert_ne!(rewrapped, handle);
    assert_eq!(handle_strength(&context, rewrapped), Strength::Strong);
    assert_eq!(context.external_memory(), object.external_bytes());

    drop(object);
    let finalized = context.run_sync(|scope| scope.collect_garbage()).unwrap();
    assert_eq!(finalized, 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    context.shutdown().unwrap();
}

#[test]
fn test_script_dispose_is_idempotent() {
    let context = spawn_context("script-dispose");

    let (first, second, empty) = context
        .run_sync(|scope| {
            let object = LifecycleObject::new(0u64);
            let script_ref = scope.wrap(&object).unwrap();
            let other = script_ref.clone();

            let first = script_ref.dispose();
            let second = other.dispose();
            (first, second, other.is_empty() && !object.is_mirrored())
        })
        .unwrap();

    assert!(first);
    assert!(!second);
    assert!(empty);

    context.shutdown().unwrap();
}

#[test]
fn test_shutdown_detaches_live_objects() {
    let context = spawn_context("teardown");
    let (payload, drops) = DropCounter::new();
    let object = LifecycleObject::new(payload);

    let owner = object.clone();
    context
        .run_sync(move |scope| {
            scope.wrap(&owner).unwrap();
        })
        .unwrap();
    assert!(object.is_mirrored());

    // Buffered off the owning thread; teardown folds it in at the latest
    object.adjust_external(64);

    context.shutdown().unwrap();

    assert!(context.is_closed());
    assert!(!object.is_mirrored());
    assert_eq!(object.state(), LifecycleState::Unmirrored);
    assert_eq!(object.pending_external(), 0);

    // Back to native-only lifetime
    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_weak_mirrors_freed_by_shutdown() {
    let context = spawn_context("teardown-weak");
    let (payload, drops) = DropCounter::new();

    context
        .run_sync(move |scope| {
            let object = LifecycleObject::new(payload);
            scope.wrap(&object).unwrap();
        })
        .unwrap();

    assert_eq!(drops.load(Ordering::SeqCst), 0);
    context.shutdown().unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropping_last_context_handle_stops_it() {
    let context = spawn_context("dropped");
    let (payload, drops) = DropCounter::new();
    let object = LifecycleObject::new(payload);
    let weak = object.downgrade();
    let kept = LifecycleObject::new(0u8);

    let owners = (object.clone(), kept.clone());
    context
        .run_sync(move |scope| {
            scope.wrap(&owners.0).unwrap();
            scope.wrap(&owners.1).unwrap();
        })
        .unwrap();

    // Weak-only from here
    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    // Mirrored objects refer to their context, but do not keep it running
    drop(context);

    assert!(wait_until(|| {
        drops.load(Ordering::SeqCst) == 1 && kept.state() == LifecycleState::Unmirrored
    }));
    assert!(weak.upgrade().is_none());
    assert!(kept.context().unwrap().is_closed());
    assert!(!kept.is_mirrored());
}

#[test]
fn test_context_clone_keeps_it_running() {
    let context = spawn_context("cloned");
    let other = context.clone();

    drop(context);
    assert_eq!(other.run_sync(|_| 3).unwrap(), 3);
    assert!(!other.is_closed());

    other.shutdown().unwrap();
}

#[test]
fn test_panicking_observer_does_not_leak_mirror() {
    let context = RuntimeContext::spawn(
        ContextConfig::new("panicking-observer")
            .with_gc_external_threshold(0)
            .with_strength_observer(|change: &StrengthChange| {
                if change.from == Strength::Strong && change.to == Strength::Weak {
                    panic!("observer rejected weakening {}", change.handle);
                }
            }),
    )
    .unwrap();

    let (payload, drops) = DropCounter::new();
    let object = LifecycleObject::new(payload);
    let weak = object.downgrade();

    let owner = object.clone();
    let handle = context
        .run_sync(move |scope| scope.wrap(&owner).unwrap().handle())
        .unwrap();

    // The handed-off Unref weakens the handle, then the observer panics
    thread::spawn(move || drop(object)).join().unwrap();

    assert_eq!(handle_strength(&context, handle), Strength::Weak);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    let finalized = context.run_sync(|scope| scope.collect_garbage()).unwrap();
    assert_eq!(finalized, 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(context.external_memory(), 0);
    assert!(weak.upgrade().is_none());

    context.shutdown().unwrap();
}

#[test]
fn test_observer_may_read_object_during_wrap() {
    let slot: Arc<Mutex<Option<WeakObject<u32>>>> = Arc::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let observer = {
        let slot = Arc::clone(&slot);
        let seen = Arc::clone(&seen);
        move |change: &StrengthChange| {
            if change.from != Strength::Empty {
                return;
            }

            let weak = slot.lock().clone();
            if let Some(object) = weak.and_then(|weak| weak.upgrade()) {
                seen.lock().push((object.ref_count(), object.state()));
            }
        }
    };

    let context = RuntimeContext::spawn(
        ContextConfig::new("observer-reads")
            .with_gc_external_threshold(0)
            .with_strength_observer(observer),
    )
    .unwrap();

    let object = LifecycleObject::new(9u32);
    *slot.lock() = Some(object.downgrade());

    let owner = object.clone();
    let handle = context
        .run_sync(move |scope| scope.wrap(&owner).unwrap().handle())
        .unwrap();

    // Owner, the clone moved into the task, and the observer's own upgrade
    assert_eq!(*seen.lock(), vec![(3, LifecycleState::Unmirrored)]);
    assert_eq!(object.mirror(), Some(handle));
    assert_eq!(object.state(), LifecycleState::MirroredStrong);

    drop(object);
    context.shutdown().unwrap();
}
