use std::{
    sync::{atomic::Ordering, mpsc, Arc, Barrier},
    thread,
    time::Duration,
};

use proptest::prelude::*;

use crate::{
    capability::{Access, Aliasing, BoxTag, Capability},
    config::{Config, LockDiscipline},
    consume,
    error::Error,
    heap::{self, trace_word, LinkCode},
    reference::{Init, Ref, Weak},
    shape::{Shape, Value},
    wait, Future,
};

use Capability::{Asy, Imm, Iso, Mut, Syn};

fn init_tracing()
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node() -> Arc<Shape>
{
    Shape::builder("Node")
        .data("value")
        .field("next", Mut)
        .field("other", Mut)
        .boxed("seen")
        .field("shared", Imm)
        .field("inner", Iso)
        .build()
}

fn alloc(capability: Capability) -> Ref { Ref::alloc(capability, &node()).unwrap() }

fn int(r: &Ref, field: &str) -> i64
{
    match r.get(field).unwrap() {
        Value::Int(n) => n,
        other => panic!("expected an integer, got {:?}", other),
    }
}

/// A chain of `len` mut objects, head first in the returned weak handles.
fn chain(len: usize) -> (Ref, Vec<Weak>)
{
    let shape = node();
    let mut head: Option<Ref> = None;
    let mut weaks = Vec::new();
    for i in 0..len {
        let mut fields = vec![("value", Init::from(i as i64))];
        if let Some(h) = head.take() {
            fields.push(("next", h.into()));
        }
        let r = Ref::alloc_with(Mut, &shape, fields).unwrap();
        weaks.push(r.downgrade());
        head = Some(r);
    }
    weaks.reverse();
    (head.unwrap(), weaks)
}

#[test]
fn capability_tables()
{
    let sendable: Vec<_> = Capability::ALL.iter().filter(|c| c.is_sendable()).collect();
    assert_eq!(sendable, [&Imm, &Syn, &Asy, &Iso]);

    let atomic: Vec<_> = Capability::ALL.iter().filter(|c| c.is_atomic()).collect();
    assert_eq!(atomic, [&Imm, &Capability::BOX1, &Syn, &Asy]);

    assert!(Mut.alias_compatible(Capability::BOX0));
    assert!(!Mut.alias_compatible(Capability::BOX1));
    assert!(Imm.alias_compatible(Capability::BOX1));
    assert!(!Iso.alias_compatible(Iso));
    assert!(!Mut.alias_compatible(Imm));

    assert_eq!(Imm.field_capability(Mut), Imm);
    assert_eq!(Capability::BOX1.field_capability(Mut), Capability::BOX1);
    assert_eq!(Mut.field_capability(Iso), Iso);
    assert_eq!(Capability::BOX0.field_capability(Capability::BOX1), Capability::BOX1);

    assert_eq!(Capability::BOX1.to_string(), "box(1)");
}

#[test]
fn fresh_object_counts()
{
    let a = alloc(Mut);
    let w = a.downgrade();
    assert_eq!(w.open_count(), Some(1));
    assert_eq!(w.owning_count(), Some(0));
    assert_eq!(w.is_reserved(), Some(false));
    assert_eq!(heap::object(a.id()).trace.load(Ordering::Relaxed), 0);
}

#[test]
fn reserved_bit_follows_atomic_updates()
{
    let a = alloc(Mut);
    let w = a.downgrade();

    let b = a.alias(Mut).unwrap();
    assert_eq!(w.open_count(), Some(2));
    assert_eq!(w.is_reserved(), Some(false));
    drop(b);
    assert_eq!(w.open_count(), Some(1));

    let a = a.consume(Imm).unwrap();
    assert_eq!(w.is_reserved(), Some(false));
    let c = a.alias(Imm).unwrap();
    assert_eq!(w.open_count(), Some(2));
    assert_eq!(w.is_reserved(), Some(true));
    drop(c);
    assert_eq!(w.open_count(), Some(1));
}

#[test]
fn self_cycle_is_isolated()
{
    init_tracing();
    let a = alloc(Mut);
    a.store("next", Some(a.alias(Mut).unwrap())).unwrap();
    let w = a.downgrade();
    assert_eq!(w.open_count(), Some(2));

    let tally = consume::verify(a.link(), false).unwrap();
    assert_eq!((tally.collected, tally.edges, tally.open), (1, 1, 2));

    let iso = a.consume(Iso).unwrap();
    assert_eq!(iso.capability(), Iso);
    assert_eq!(w.open_count(), Some(2));
}

#[test]
fn external_alias_refuses_consume()
{
    let a = alloc(Mut);
    a.set("value", 5).unwrap();
    a.store("next", Some(a.alias(Mut).unwrap())).unwrap();
    let extra = a.alias(Mut).unwrap();
    let w = a.downgrade();

    let refused = a.consume(Iso).unwrap_err();
    assert_eq!(refused.error, Error::NotIsolated);
    let a = refused.into_inner();
    assert!(a.is_valid());
    assert_eq!(a.capability(), Mut);
    assert_eq!(int(&a, "value"), 5);
    assert_eq!(w.open_count(), Some(3));
    assert_eq!(heap::object(a.id()).trace.load(Ordering::Relaxed), 0);

    drop(extra);
    assert!(a.consume(Iso).is_ok());
}

#[test]
fn diamond_counts_every_edge()
{
    let shape = node();
    let d = Ref::alloc(Mut, &shape).unwrap();
    let wd = d.downgrade();
    let b = Ref::alloc_with(Mut, &shape, [("next", Init::from(d.alias(Mut).unwrap()))]).unwrap();
    let c = Ref::alloc_with(Mut, &shape, [("next", Init::from(d))]).unwrap();
    let r = Ref::alloc_with(Mut, &shape, [("next", Init::from(b)), ("other", Init::from(c))]).unwrap();
    assert_eq!(wd.open_count(), Some(2));

    let tally = consume::verify(r.link(), false).unwrap();
    assert_eq!((tally.collected, tally.edges, tally.open), (4, 4, 5));
    assert!(tally.isolated());

    let peek = r.load("next").unwrap().unwrap().load("next").unwrap().unwrap();
    let refused = r.consume(Iso).unwrap_err();
    assert_eq!(refused.error, Error::NotIsolated);

    drop(peek);
    let iso = refused.into_inner().consume(Iso).unwrap();
    assert_eq!(wd.open_count(), Some(2));
    drop(iso);
    assert!(!wd.is_live());
}

#[test]
fn imm_and_box1_fields_are_not_traversed()
{
    let shared = alloc(Mut).consume(Imm).unwrap();
    let holder = alloc(Mut);
    holder.store("shared", Some(shared.alias(Imm).unwrap())).unwrap();
    holder.store("seen", Some(shared.alias(Capability::BOX1).unwrap())).unwrap();

    let tally = consume::verify(holder.link(), false).unwrap();
    assert_eq!((tally.collected, tally.edges, tally.open), (1, 0, 1));
    assert!(holder.consume(Iso).is_ok());
}

#[test]
fn claim_by_another_thread_refuses()
{
    let (head, weaks) = chain(3);
    let head = head.consume(Imm).unwrap();
    let foreign = trace_word(u32::MAX - 7, LinkCode::End);
    let tail = heap::object(weaks[2].id());
    tail.trace.store(foreign, Ordering::Release);

    let refused = head.consume(Iso).unwrap_err();
    assert_eq!(refused.error, Error::NotIsolated);
    // our own claims were withdrawn, the foreign one left alone
    assert_eq!(heap::object(weaks[0].id()).trace.load(Ordering::Acquire), 0);
    assert_eq!(tail.trace.load(Ordering::Acquire), foreign);

    tail.trace.store(0, Ordering::Release);
    assert!(refused.into_inner().consume(Iso).is_ok());
}

#[test]
fn racing_imm_consumes_never_both_succeed()
{
    init_tracing();
    for _ in 0..50 {
        let (head, _) = chain(4);
        let a = head.consume(Imm).unwrap();
        let b = a.alias(Imm).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let threads: Vec<_> = [a, b]
            .into_iter()
            .map(|r| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    r.consume(Iso).is_ok()
                })
            })
            .collect();
        let won = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert!(won <= 1);
    }
}

#[test]
fn count_change_during_the_tally_refuses()
{
    let (head, weaks) = chain(3);
    let head = head.consume(Imm).unwrap();

    let quiet = consume::verify_interleaved(head.link(), true, || ()).unwrap();
    assert!(quiet.isolated());

    // a transient alias of a collected child leaves the sum balanced
    let busy = consume::verify_interleaved(head.link(), true, || drop(head.load("next").unwrap()));
    assert_eq!(busy, Err(Error::NotIsolated));
    assert_eq!(weaks[1].open_count(), Some(1));
    assert!(weaks
        .iter()
        .all(|w| heap::object(w.id()).trace.load(Ordering::Acquire) == 0));

    assert!(head.consume(Iso).is_ok());
}

#[test]
fn one_holder_wins_after_the_other_lets_go()
{
    let (head, weaks) = chain(4);
    let a = head.consume(Imm).unwrap();
    let b = a.alias(Imm).unwrap();

    let t = thread::spawn(move || drop(b));
    t.join().unwrap();

    let iso = a.consume(Iso).unwrap();
    assert_eq!(weaks[0].open_count(), Some(1));
    drop(iso);
    assert!(weaks.iter().all(|w| !w.is_live()));
}

#[test]
fn box_tags_propagate_through_loads()
{
    let holder = alloc(Mut);
    let target = alloc(Mut);
    let shared = alloc(Mut).consume(Imm).unwrap();

    holder.store("seen", Some(target.alias(Capability::BOX0).unwrap())).unwrap();
    holder.store("next", Some(target)).unwrap();
    holder.store("shared", Some(shared.alias(Imm).unwrap())).unwrap();

    let view = holder.alias(Capability::BOX0).unwrap();
    assert_eq!(view.load("seen").unwrap().unwrap().capability(), Capability::BOX0);
    assert_eq!(view.load("next").unwrap().unwrap().capability(), Capability::BOX0);
    assert_eq!(view.load("shared").unwrap().unwrap().capability(), Imm);

    holder.store("seen", Some(shared.alias(Capability::BOX1).unwrap())).unwrap();
    assert_eq!(view.load("seen").unwrap().unwrap().capability(), Capability::BOX1);
    assert_eq!(holder.load("seen").unwrap().unwrap().capability(), Capability::BOX1);
    drop(view);

    let frozen = holder.consume(Imm).unwrap();
    assert_eq!(frozen.load("next").unwrap().unwrap().capability(), Imm);
    assert_eq!(frozen.load("seen").unwrap().unwrap().capability(), Imm);
    let view = frozen.alias(Capability::BOX1).unwrap();
    assert_eq!(view.load("next").unwrap().unwrap().capability(), Capability::BOX1);
}

#[test]
fn misuse_is_reported()
{
    let m = alloc(Mut);
    assert_eq!(
        m.alias(Imm).unwrap_err(),
        Error::IncompatibleCapability { from: Mut, to: Imm }
    );
    assert!(matches!(m.get("missing"), Err(Error::UnknownField { .. })));
    assert!(matches!(m.get("next"), Err(Error::FieldKind { .. })));
    assert!(matches!(
        m.store("next", Some(alloc(Mut).consume(Imm).unwrap())),
        Err(Error::IncompatibleCapability { .. })
    ));

    m.store("inner", Some(alloc(Iso))).unwrap();
    assert!(matches!(m.load("inner"), Err(Error::AccessDenied { .. })));
    assert_eq!(m.take("inner").unwrap().unwrap().capability(), Iso);
    assert!(m.load("inner").unwrap().is_none());

    let i = m.consume(Imm).unwrap();
    assert!(matches!(i.set("value", 1), Err(Error::AccessDenied { .. })));

    let s = alloc(Iso);
    assert!(matches!(s.get("value"), Err(Error::AccessDenied { .. })));
    assert!(matches!(Ref::alloc(Syn, &node()), Err(Error::AccessDenied { .. })));
}

#[test]
fn cast_only_from_iso()
{
    let m = alloc(Mut);
    let refused = m.cast(Iso).unwrap_err();
    assert_eq!(refused.error, Error::IncompatibleCapability { from: Mut, to: Iso });
    assert_eq!(refused.reference.capability(), Mut);

    let i = alloc(Iso);
    let w = i.downgrade();
    let m = i.cast(Mut).unwrap();
    assert_eq!(m.capability(), Mut);
    assert_eq!(w.open_count(), Some(1));
}

#[test]
fn consume_round_trip_restores_counts()
{
    let (head, weaks) = chain(5);
    head.store("other", Some(head.load("next").unwrap().unwrap())).unwrap();
    let before: Vec<_> = weaks.iter().map(Weak::open_count).collect();

    let iso = head.consume(Iso).unwrap();
    let back = iso.consume(Mut).unwrap();

    let after: Vec<_> = weaks.iter().map(Weak::open_count).collect();
    assert_eq!(before, after);
    let next = back.load("next").unwrap().unwrap();
    assert_eq!(next.id(), weaks[1].id());
    assert!(back.load("other").unwrap().unwrap().same_object(&next));
}

#[test]
fn syn_bias_and_scope_counts()
{
    let s = alloc(Mut).into_syn(LockDiscipline::ReaderWriter).unwrap();
    let w = s.downgrade();
    assert_eq!((w.open_count(), w.owning_count()), (Some(1), Some(1)));

    let seen = s
        .locked(Mut, |scope| {
            scope.target().set("value", 9).unwrap();
            (w.open_count(), w.owning_count())
        })
        .unwrap();
    assert_eq!(seen, (Some(2), Some(2)));
    assert_eq!((w.open_count(), w.owning_count()), (Some(1), Some(1)));

    let s2 = s.alias(Syn).unwrap();
    assert_eq!((w.open_count(), w.owning_count()), (Some(1), Some(2)));

    let refused = s.consume(Mut).unwrap_err();
    assert_eq!(refused.error, Error::NotIsolated);
    let s = refused.into_inner();
    drop(s2);

    let m = s.consume(Mut).unwrap();
    assert_eq!((w.open_count(), w.owning_count()), (Some(1), Some(0)));
    assert_eq!(int(&m, "value"), 9);
}

#[test]
fn owning_zero_frees_eagerly()
{
    let child = alloc(Mut);
    let wc = child.downgrade();
    let root = Ref::alloc_with(Mut, &node(), [("next", Init::from(child))]).unwrap();
    let s = root.consume(Syn).unwrap();
    let ws = s.downgrade();

    let s2 = s.alias(Syn).unwrap();
    drop(s);
    assert!(ws.is_live());
    drop(s2);
    assert!(!ws.is_live());
    assert!(!wc.is_live());
}

#[test]
fn release_cascades_through_fields()
{
    let (head, weaks) = chain(6);
    let frozen = head.consume(Imm).unwrap();
    let second = frozen.load("next").unwrap().unwrap();
    drop(frozen);
    assert!(!weaks[0].is_live());
    assert!(weaks[1..].iter().all(Weak::is_live));
    drop(second);
    assert!(weaks.iter().all(|w| !w.is_live()));
}

#[test]
fn mut_self_cycle_is_not_reclaimed()
{
    let a = alloc(Mut);
    a.store("next", Some(a.alias(Mut).unwrap())).unwrap();
    let w = a.downgrade();
    drop(a);
    assert!(w.is_live());
    assert_eq!(w.open_count(), Some(1));
}

#[test]
fn stale_weak_handles_never_see_a_reused_slot()
{
    let a = alloc(Mut);
    let w = a.downgrade();
    drop(a);
    assert!(!w.is_live());
    let fresh: Vec<_> = (0..8).map(|_| alloc(Mut)).collect();
    assert!(!w.is_live());
    assert_eq!(w.open_count(), None);

    let stats = crate::stats();
    assert!(stats.slabs >= 1);
    assert!(stats.capacity >= heap::SLAB_SIZE);
    assert!(stats.live_objects >= fresh.len());
    assert!(stats.untouched_slots() < stats.capacity);
    assert!(stats.occupancy() > 0.0 && stats.occupancy() <= 1.0);
}

#[test]
fn relax_restores_the_source()
{
    let mut iso = alloc(Iso);
    let w = iso.downgrade();

    let escaped = iso
        .relax(Mut, |scope| {
            scope.target().set("value", 4).unwrap();
            assert_eq!(w.open_count(), Some(2));
            scope.target().alias(Mut).unwrap()
        })
        .unwrap();

    assert!(!escaped.is_valid());
    assert_eq!(w.open_count(), Some(1));
    let seen = iso
        .relax(Capability::BOX1, |scope| (scope.capability(), int(scope.target(), "value")))
        .unwrap();
    assert_eq!(seen, (Capability::BOX0, 4));
    assert_eq!(
        iso.relax(Imm, |_| ()).unwrap_err(),
        Error::IncompatibleCapability { from: Iso, to: Imm }
    );
}

#[test]
#[should_panic(expected = "capability scope violation")]
fn escaped_scope_reference_is_fatal()
{
    let mut iso = alloc(Iso);
    let escaped = iso.relax(Mut, |scope| scope.target().alias(Mut).unwrap()).unwrap();
    let _ = escaped.get("value");
}

#[test]
#[should_panic(expected = "capability scope violation")]
fn non_sendable_capture_is_fatal()
{
    let outer = alloc(Mut);
    let mut iso = alloc(Iso);
    let _ = iso.relax(Mut, |_| outer.get("value"));
}

#[test]
fn sendable_capture_is_visible()
{
    let outer = alloc(Mut);
    outer.set("value", 11).unwrap();
    let outer = outer.consume(Imm).unwrap();
    let mut iso = alloc(Iso);
    let n = iso.relax(Mut, |_| int(&outer, "value")).unwrap();
    assert_eq!(n, 11);
}

#[test]
fn mut_reference_is_confined_to_its_thread()
{
    let m = alloc(Mut);
    let t = thread::spawn(move || {
        let _ = m.get("value");
    });
    assert!(t.join().is_err());
}

#[test]
fn relax_field_of_iso_member()
{
    let holder = alloc(Mut);
    holder.store("inner", Some(alloc(Iso))).unwrap();

    holder
        .relax_field("inner", Mut, |scope| scope.target().set("value", 3).unwrap())
        .unwrap();
    let tag = holder
        .relax_field("inner", Capability::BOX1, |scope| scope.capability())
        .unwrap();
    assert_eq!(tag, Capability::BOX0);

    let frozen = holder.consume(Imm).unwrap();
    let (cap, n) = frozen
        .relax_field("inner", Capability::BOX0, |scope| (scope.capability(), int(scope.target(), "value")))
        .unwrap();
    assert_eq!((cap, n), (Capability::BOX1, 3));
    assert!(matches!(
        frozen.relax_field("inner", Mut, |_| ()),
        Err(Error::IncompatibleCapability { .. })
    ));
    assert!(matches!(
        frozen.relax_field("next", Capability::BOX0, |_| ()),
        Err(Error::FieldKind { .. })
    ));
}

#[test]
#[should_panic(expected = "lock reentrancy violation")]
fn exclusive_reentry_is_fatal()
{
    let s = alloc(Mut).into_syn(LockDiscipline::ReaderWriter).unwrap();
    let _ = s.locked(Mut, |_| s.locked(Mut, |_| ()));
}

#[test]
fn shared_reentry_is_allowed()
{
    let s = alloc(Mut).into_syn(LockDiscipline::ReaderWriter).unwrap();
    let inner = s
        .rlocked(Capability::BOX0, |_| s.rlocked(Capability::BOX0, |scope| scope.capability()).unwrap())
        .unwrap();
    assert_eq!(inner, Capability::BOX1);
    assert!(matches!(s.rlocked(Mut, |_| ()), Err(Error::IncompatibleCapability { .. })));
}

#[test]
fn recursive_discipline_allows_nesting()
{
    let s = alloc(Mut).into_syn(LockDiscipline::Recursive).unwrap();
    let w = s.downgrade();
    let inner = s
        .locked(Mut, |_| {
            s.wlocked(Mut, |scope| {
                scope.target().set("value", 1).unwrap();
                (scope.capability(), w.owning_count())
            })
            .unwrap()
        })
        .unwrap();
    assert_eq!(inner, (Mut, Some(3)));
    assert_eq!(w.owning_count(), Some(1));
}

#[test]
fn readers_share_the_lock()
{
    let s = alloc(Mut).into_syn(LockDiscipline::ReaderWriter).unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let s = s.alias(Syn).unwrap();
            let barrier = barrier.clone();
            thread::spawn(move || {
                s.rlocked(Capability::BOX0, |scope| {
                    barrier.wait();
                    scope.capability()
                })
                .unwrap()
            })
        })
        .collect();
    for r in readers {
        assert_eq!(r.join().unwrap(), Capability::BOX1);
    }
}

#[test]
fn locked_box_is_a_reader_under_reader_writer()
{
    let s = alloc(Mut).into_syn(LockDiscipline::ReaderWriter).unwrap();
    assert_eq!(s.locked(Capability::BOX0, |scope| scope.capability()).unwrap(), Capability::BOX1);
    assert_eq!(s.locked(Mut, |scope| scope.capability()).unwrap(), Mut);
    assert_eq!(s.wlocked(Capability::BOX1, |scope| scope.capability()).unwrap(), Capability::BOX0);

    let nested = s
        .locked(Capability::BOX0, |_| s.locked(Capability::BOX0, |scope| scope.capability()).unwrap())
        .unwrap();
    assert_eq!(nested, Capability::BOX1);

    let barrier = Arc::new(Barrier::new(2));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let s = s.alias(Syn).unwrap();
            let barrier = barrier.clone();
            thread::spawn(move || {
                s.locked(Capability::BOX0, |scope| {
                    barrier.wait();
                    scope.capability()
                })
                .unwrap()
            })
        })
        .collect();
    for r in readers {
        assert_eq!(r.join().unwrap(), Capability::BOX1);
    }
}

#[test]
fn recursive_lock_never_hands_out_box1()
{
    let s = alloc(Mut).into_syn(LockDiscipline::Recursive).unwrap();
    assert_eq!(s.locked(Capability::BOX1, |scope| scope.capability()).unwrap(), Capability::BOX0);
    assert_eq!(s.rlocked(Capability::BOX1, |scope| scope.capability()).unwrap(), Capability::BOX0);

    let inner = s
        .locked(Mut, |outer| {
            outer.target().set("value", 5).unwrap();
            s.rlocked(Capability::BOX0, |scope| (scope.capability(), int(scope.target(), "value")))
                .unwrap()
        })
        .unwrap();
    assert_eq!(inner, (Capability::BOX0, 5));
    assert!(matches!(s.rlocked(Mut, |_| ()), Err(Error::IncompatibleCapability { .. })));
}

#[test]
fn writers_exclude_each_other()
{
    let s = alloc(Mut).consume(Syn).unwrap();
    s.locked(Mut, |scope| scope.target().set("value", 0).unwrap()).unwrap();
    let writers: Vec<_> = (0..4)
        .map(|_| {
            let s = s.alias(Syn).unwrap();
            thread::spawn(move || {
                for _ in 0..100 {
                    s.wlocked(Mut, |scope| {
                        let n = int(scope.target(), "value");
                        scope.target().set("value", n + 1).unwrap();
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    let n = s.locked(Capability::BOX0, |scope| int(scope.target(), "value")).unwrap();
    assert_eq!(n, 400);
}

#[test]
fn tasks_run_in_submission_order()
{
    init_tracing();
    let actor = alloc(Mut).consume(Asy).unwrap();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut last = None;
    for i in 0..100 {
        let log = log.clone();
        last = Some(actor.schedule(Mut, move |_| log.lock().push(i)).unwrap());
    }
    last.unwrap().wait();
    assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
}

#[test]
fn relax_of_actor_waits_for_queued_tasks()
{
    let mut actor = alloc(Mut).consume(Asy).unwrap();
    actor.schedule(Mut, |scope| scope.target().set("value", 0).unwrap()).unwrap();
    for _ in 0..10 {
        actor
            .schedule(Mut, |scope| {
                thread::sleep(Duration::from_millis(1));
                let n = int(scope.target(), "value");
                scope.target().set("value", n + 1).unwrap();
            })
            .unwrap();
    }
    let n = actor.relax(Mut, |scope| int(scope.target(), "value")).unwrap();
    assert_eq!(n, 10);
}

#[test]
fn future_waits_implicitly()
{
    let actor = alloc(Mut).consume(Asy).unwrap();
    let w = actor.downgrade();
    let mut fut = Future::new(actor).unwrap();
    fut.schedule(Mut, |scope| {
        thread::sleep(Duration::from_millis(50));
        scope.target().set("value", 42).unwrap();
    })
    .unwrap();

    let v = fut.relax(Mut, |scope| scope.target().get("value").unwrap()).unwrap();
    assert_eq!(v, Value::Int(42));

    fut.schedule(Mut, |scope| scope.target().set("value", 43).unwrap()).unwrap();
    wait(&mut fut);
    assert!(!fut.is_pending());

    let m = fut.consume(Mut).unwrap();
    assert_eq!(int(&m, "value"), 43);
    assert_eq!((w.open_count(), w.owning_count()), (Some(1), Some(0)));
}

#[test]
fn future_rejects_non_actor()
{
    assert!(matches!(
        Future::new(alloc(Mut)),
        Err(Error::IncompatibleCapability { .. })
    ));
}

#[test]
fn scheduled_task_receives_consumed_argument()
{
    let actor = alloc(Mut).consume(Asy).unwrap();
    let arg = alloc(Mut);
    arg.set("value", 7).unwrap();
    let warg = arg.downgrade();
    let (tx, rx) = mpsc::channel();

    actor
        .schedule_consuming(Mut, arg, move |scope| {
            let mut arg = scope.take_arg().unwrap();
            assert!(scope.take_arg().is_none());
            let capability = arg.capability();
            let n = arg.relax(Mut, |a| int(a.target(), "value")).unwrap();
            scope.target().set("value", n * 2).unwrap();
            scope.target().store("inner", Some(arg)).unwrap();
            tx.send(capability).unwrap();
        })
        .unwrap()
        .wait();
    assert_eq!(rx.recv().unwrap(), Iso);
    assert!(warg.is_live());

    let shared = alloc(Mut);
    let keep = shared.alias(Mut).unwrap();
    let refused = actor.schedule_consuming(Mut, shared, |_| ()).unwrap_err();
    assert_eq!(refused.error, Error::NotIsolated);
    drop(keep);

    let mut fut = Future::consuming(actor, refused.into_inner()).unwrap();
    fut.schedule(Mut, |scope| assert!(scope.take_arg().is_some())).unwrap();
    let m = fut.into_inner().consume(Mut).unwrap();
    assert_eq!(int(&m, "value"), 14);
}

#[test]
fn refused_future_hands_back_both_references()
{
    let actor = alloc(Mut).consume(Asy).unwrap();
    let wa = actor.downgrade();
    let shared = alloc(Mut);
    shared.set("value", 3).unwrap();
    let keep = shared.alias(Mut).unwrap();
    let ws = shared.downgrade();

    let Err(refused) = Future::consuming(actor, shared) else {
        panic!("an aliased argument must be refused");
    };
    assert_eq!(refused.error, Error::NotIsolated);
    assert_eq!(refused.target.capability(), Asy);
    assert_eq!(refused.arg.capability(), Mut);
    assert!(wa.is_live());
    assert_eq!((wa.open_count(), wa.owning_count()), (Some(1), Some(1)));
    assert_eq!(ws.open_count(), Some(2));
    drop(keep);

    let mut fut = Future::consuming(refused.target, refused.arg).unwrap();
    assert_eq!(
        fut.schedule(Imm, |_| ()).unwrap_err(),
        Error::IncompatibleCapability { from: Asy, to: Imm }
    );
    let (tx, rx) = mpsc::channel();
    fut.schedule(Mut, move |scope| {
        let mut arg = scope.take_arg().unwrap();
        tx.send(arg.relax(Mut, |a| int(a.target(), "value")).unwrap()).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv().unwrap(), 3);

    let Err(refused) = Future::consuming(alloc(Mut), alloc(Mut)) else {
        panic!("only an asy target makes a future");
    };
    assert_eq!(refused.error, Error::IncompatibleCapability { from: Mut, to: Asy });
    assert_eq!(refused.arg.capability(), Mut);
}

#[test]
#[should_panic(expected = "capability scope violation")]
fn unconsumed_iso_in_task_is_fatal()
{
    let actor = alloc(Mut).consume(Asy).unwrap();
    let iso = alloc(Iso);
    actor
        .schedule(Mut, move |_| {
            let _ = iso.get("value");
        })
        .unwrap()
        .wait();
}

#[test]
#[should_panic(expected = "lock reentrancy violation")]
fn waiting_on_own_actor_is_fatal()
{
    let actor = alloc(Mut).consume(Asy).unwrap();
    let me = actor.alias(Asy).unwrap();
    actor
        .schedule(Mut, move |_| me.schedule(Mut, |_| ()).unwrap().wait())
        .unwrap()
        .wait();
}

#[test]
fn worker_survives_a_panicking_task()
{
    let actor = alloc(Mut).consume(Asy).unwrap();
    let bad = actor.schedule(Mut, |_| panic!("boom")).unwrap();
    let good = actor.schedule(Mut, |scope| scope.target().set("value", 1).unwrap()).unwrap();
    good.wait();
    assert!(bad.is_finished());
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| bad.wait()));
    assert!(caught.is_err());
}

#[test]
fn syn_becomes_asy()
{
    let s = alloc(Mut).consume(Syn).unwrap();
    let w = s.downgrade();
    let a = s.consume(Asy).unwrap();
    assert_eq!((w.open_count(), w.owning_count()), (Some(1), Some(1)));
    a.schedule(Mut, |scope| scope.target().set("value", 2).unwrap()).unwrap().wait();
    assert!(matches!(a.locked(Mut, |_| ()), Err(Error::IncompatibleCapability { .. })));
    let m = a.consume(Mut).unwrap();
    assert_eq!(int(&m, "value"), 2);
}

#[test]
fn config_defaults()
{
    let config = Config::default();
    assert_eq!(config.lock_discipline, LockDiscipline::ReaderWriter);
    assert_eq!(config.worker_name, "refcap-actor");
    assert_eq!(config.worker_stack_size, None);
    assert_eq!(LockDiscipline::parse(" Recursive "), Some(LockDiscipline::Recursive));
    assert_eq!(LockDiscipline::parse("rw"), Some(LockDiscipline::ReaderWriter));
    assert_eq!(LockDiscipline::parse("spin"), None);
}

fn any_capability() -> impl Strategy<Value = Capability> { proptest::sample::select(Capability::ALL.to_vec()) }

fn any_tag() -> impl Strategy<Value = BoxTag> { prop_oneof![Just(BoxTag::Zero), Just(BoxTag::One)] }

proptest! {
    #[test]
    fn sendable_iff_not_locally_aliased(c in any_capability())
    {
        prop_assert_eq!(c.is_sendable(), c.aliasing() != Aliasing::Local);
    }

    #[test]
    fn aliases_stay_in_their_count(c in any_capability(), t in any_capability())
    {
        if c.alias_compatible(t) {
            prop_assert_eq!(c.is_owning(), t.is_owning());
            prop_assert_ne!(t, Iso);
        }
    }

    #[test]
    fn read_only_roots_never_yield_writable_fields(root in any_capability(), field in any_capability())
    {
        if root.access() == Access::Read {
            prop_assert_ne!(root.field_capability(field).access(), Access::ReadWrite);
        }
    }

    #[test]
    fn box_tags_only_grow(a in any_tag(), b in any_tag())
    {
        prop_assert_eq!(Capability::Box(a).box_tag_on_alias(Some(b)), Some(a.join(b)));
        prop_assert_eq!(Capability::Box(a).field_capability(Capability::Box(b)), Capability::Box(a.join(b)));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn chains_are_isolated_unless_aliased(len in 1usize..12, at in 0usize..12)
    {
        let (head, weaks) = chain(len);
        let at = at % len;

        let mut cursor = head.alias(Mut).unwrap();
        for _ in 0..at {
            cursor = cursor.load("next").unwrap().unwrap();
        }
        prop_assert_eq!(cursor.id(), weaks[at].id());

        let refused = head.consume(Iso).unwrap_err();
        prop_assert_eq!(&refused.error, &Error::NotIsolated);
        drop(cursor);

        let iso = refused.into_inner().consume(Iso).unwrap();
        drop(iso);
        prop_assert!(weaks.iter().all(|w| !w.is_live()));
    }
}
