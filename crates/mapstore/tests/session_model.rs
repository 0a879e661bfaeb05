//! Session behavior checked against an in-memory model.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;

use mapstore::{CursorOp, EngineError, Env, EnvFlags, Session, SessionConfig};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = proptest::collection::vec(any::<u8>(), 1..12);
    let value = proptest::collection::vec(any::<u8>(), 0..600);
    prop_oneof![
        3 => (key.clone(), value).prop_map(|(k, v)| Op::Put(k, v)),
        1 => key.prop_map(Op::Del),
    ]
}

fn small_session() -> Session {
    Session::init(SessionConfig {
        initial_map_size: 4096,
        ..SessionConfig::default()
    })
    .expect("init")
}

fn walk(session: &mut Session) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut op = CursorOp::First;
    while let Some((k, v)) = session.cursor_get(op).expect("cursor") {
        out.push((k.to_vec(), v.to_vec()));
        op = CursorOp::Next;
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn session_matches_model(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.mdb");
        let mut session = small_session();
        session.open(&path, EnvFlags::CREATE, false).expect("open");
        // Enough headroom for 60 puts of 600 bytes from a 4 KiB start
        session.control(mapstore::Control::ApiRetryLimit(8));

        let mut model = BTreeMap::new();
        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    session.put(k, v, false).expect("put");
                    model.insert(k.clone(), v.clone());
                }
                Op::Del(k) => {
                    let existed = session.del(k).expect("del");
                    prop_assert_eq!(existed, model.remove(k).is_some());
                }
            }
        }

        let expected: Vec<_> = model.clone().into_iter().collect();
        prop_assert_eq!(walk(&mut session), expected.clone());
        session.close().expect("close");

        let mut reopened = small_session();
        reopened.open(&path, EnvFlags::READ_ONLY, false).expect("reopen");
        prop_assert_eq!(walk(&mut reopened), expected);
    }
}

#[test]
fn bulk_reads_see_own_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut session = small_session();
    session
        .open(dir.path().join("bulk.mdb"), EnvFlags::CREATE, true)
        .expect("open");

    session.put(b"k", b"v", false).expect("put");
    assert_eq!(session.get(b"k").expect("get"), Some(&b"v"[..]));
    assert!(session.del(b"k").expect("del"));
    assert_eq!(session.get(b"k").expect("get"), None);
}

#[test]
fn commit_failure_modes_are_typed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ro.mdb");
    drop(Env::open(&path, EnvFlags::CREATE, 4096).expect("create"));

    let mut session = small_session();
    session.open(&path, EnvFlags::READ_ONLY, false).expect("open");
    let err = session.put(b"k", b"v", false).expect_err("read-only");
    assert!(matches!(err, EngineError::ReadOnly));
    assert!(!err.is_map_full());
}
