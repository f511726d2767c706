//! Convergence of replicated text under randomized concurrent editing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tandem_collab::replication::{EditorBuffer, Replicator, TextEdit};

const ALPHABET: &[u8] = b"abcxyz \n(){}";

fn replica() -> Replicator {
    let mut r = Replicator::new();
    r.bind_editor(Box::new(EditorBuffer::new()));
    r
}

fn random_edit(rng: &mut StdRng, text: &str) -> TextEdit {
    let len = text.len();
    if len == 0 || rng.gen_bool(0.6) {
        let offset = rng.gen_range(0..=len);
        let n = rng.gen_range(1..=4);
        let insert: String = (0..n)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        TextEdit::insert(offset, insert)
    } else {
        let offset = rng.gen_range(0..len);
        let max = (len - offset).min(3);
        TextEdit::delete(offset, rng.gen_range(1..=max))
    }
}

/// One generated update and how many of the other replica's updates its
/// author had applied when it was made.
struct Logged {
    update: Vec<u8>,
    seen_remote: usize,
}

struct Session {
    a: Replicator,
    b: Replicator,
    log_a: Vec<Logged>,
    log_b: Vec<Logged>,
}

/// Two replicas edit concurrently with partial, in-order exchanges.
fn concurrent_session(seed: u64, steps: usize) -> Session {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut a = replica();
    let mut b = replica();
    let mut log_a: Vec<Logged> = Vec::new();
    let mut log_b: Vec<Logged> = Vec::new();
    let mut delivered_to_b = 0;
    let mut delivered_to_a = 0;

    for _ in 0..steps {
        if rng.gen_bool(0.5) {
            let edit = random_edit(&mut rng, &a.text());
            log_a.push(Logged {
                update: a.local_edit(&edit).unwrap(),
                seen_remote: delivered_to_a,
            });
        } else {
            let edit = random_edit(&mut rng, &b.text());
            log_b.push(Logged {
                update: b.local_edit(&edit).unwrap(),
                seen_remote: delivered_to_b,
            });
        }
        if rng.gen_bool(0.3) && delivered_to_b < log_a.len() {
            let upto = rng.gen_range(delivered_to_b + 1..=log_a.len());
            for u in &log_a[delivered_to_b..upto] {
                b.apply_remote_update(&u.update).unwrap();
            }
            delivered_to_b = upto;
        }
        if rng.gen_bool(0.3) && delivered_to_a < log_b.len() {
            let upto = rng.gen_range(delivered_to_a + 1..=log_b.len());
            for u in &log_b[delivered_to_a..upto] {
                a.apply_remote_update(&u.update).unwrap();
            }
            delivered_to_a = upto;
        }
    }
    for u in &log_a[delivered_to_b..] {
        b.apply_remote_update(&u.update).unwrap();
    }
    for u in &log_b[delivered_to_a..] {
        a.apply_remote_update(&u.update).unwrap();
    }
    Session { a, b, log_a, log_b }
}

/// A random delivery order of both logs that keeps each source's order and
/// never delivers an update before the remote updates its author had seen.
fn causal_order(rng: &mut StdRng, a: &[Logged], b: &[Logged]) -> Vec<Vec<u8>> {
    let (mut ia, mut ib) = (0, 0);
    let mut out = Vec::with_capacity(a.len() + b.len());
    while ia < a.len() || ib < b.len() {
        let a_ready = ia < a.len() && a[ia].seen_remote <= ib;
        let b_ready = ib < b.len() && b[ib].seen_remote <= ia;
        assert!(a_ready || b_ready, "no deliverable update");
        let take_a = if a_ready && b_ready { rng.gen_bool(0.5) } else { a_ready };
        if take_a {
            out.push(a[ia].update.clone());
            ia += 1;
        } else {
            out.push(b[ib].update.clone());
            ib += 1;
        }
    }
    out
}

#[test]
fn test_concurrent_editing_converges() {
    for seed in 0..20 {
        let s = concurrent_session(seed, 200);
        assert_eq!(s.a.text(), s.b.text(), "seed {seed}");
        assert_eq!(s.a.editor_text().unwrap(), s.a.text(), "seed {seed}");
        assert_eq!(s.b.editor_text().unwrap(), s.b.text(), "seed {seed}");
    }
}

#[test]
fn test_any_causal_delivery_order_converges() {
    let mut rng = StdRng::seed_from_u64(99);
    for seed in 0..10 {
        let s = concurrent_session(seed, 150);
        let expected = s.a.text();
        for _ in 0..5 {
            let mut c = replica();
            for u in causal_order(&mut rng, &s.log_a, &s.log_b) {
                c.apply_remote_update(&u).unwrap();
            }
            assert_eq!(c.text(), expected, "seed {seed}");
            assert_eq!(c.editor_text().unwrap(), expected);
        }
    }
}

#[test]
fn test_causal_order_respects_dependencies() {
    let mut rng = StdRng::seed_from_u64(5);
    let a = vec![
        Logged { update: vec![1], seen_remote: 0 },
        Logged { update: vec![2], seen_remote: 2 },
    ];
    let b = vec![
        Logged { update: vec![10], seen_remote: 1 },
        Logged { update: vec![11], seen_remote: 1 },
    ];
    for _ in 0..20 {
        let order = causal_order(&mut rng, &a, &b);
        assert_eq!(order, vec![vec![1], vec![10], vec![11], vec![2]]);
    }
}

#[test]
fn test_replay_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(7);
    let s = concurrent_session(7, 150);
    let mut c = replica();
    for u in causal_order(&mut rng, &s.log_a, &s.log_b) {
        c.apply_remote_update(&u).unwrap();
    }
    let text = c.text();
    assert_eq!(text, s.a.text());

    for u in causal_order(&mut rng, &s.log_a, &s.log_b) {
        assert!(!c.apply_remote_update(&u).unwrap());
    }
    assert_eq!(c.text(), text);
    assert_eq!(c.editor_text().unwrap(), text);
}

#[test]
fn test_concurrent_seeding_yields_one_copy() {
    let template = "def solve(nums, target):\n    pass\n";
    let mut a = replica();
    let mut b = replica();
    let seed_a = a.seed_if_empty(template).unwrap().unwrap();
    let seed_b = b.seed_if_empty(template).unwrap().unwrap();

    a.apply_remote_update(&seed_b).unwrap();
    b.apply_remote_update(&seed_a).unwrap();
    assert_eq!(a.text(), template);
    assert_eq!(b.text(), template);
}

#[test]
fn test_full_state_sync_brings_late_replica_up_to_date() {
    let s = concurrent_session(3, 100);
    let mut late = replica();
    let sv = late.state_vector().unwrap();
    late.apply_remote_update(&s.a.diff_since(&sv).unwrap()).unwrap();
    assert_eq!(late.text(), s.a.text());
    assert_eq!(late.editor_text().unwrap(), s.a.text());
}
