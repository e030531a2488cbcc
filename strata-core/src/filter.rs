//! Compilation of row predicates into block intervals over a sparse
//! index. The evaluator is conservative: it may return blocks that hold
//! no matching rows, but never drops a block that could.

use crate::pack::sparse::{FieldPath, SparseIndex};
use crate::sdr::OwnedDatum;

pub const MICROS_PER_SEC: i64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Timestamp conversion applied to the field before comparing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeConv {
    None,
    /// `to_unix_epoch(p)`: whole seconds.
    UnixEpoch,
    /// `to_unix_micro(p)`: microseconds.
    UnixMicro,
}

/// Predicate expression in disjunctive-normal-friendly shape; the
/// normalizer is expected to have pushed negations inward already, but
/// `Not` still evaluates correctly via complement.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Cmp {
        op: CmpOp,
        path: FieldPath,
        value: OwnedDatum,
        conv: TimeConv,
    },
    In {
        path: FieldPath,
        set: Vec<OwnedDatum>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn cmp(op: CmpOp, path: &[&str], value: OwnedDatum) -> Expr {
        Expr::Cmp {
            op,
            path: path.iter().map(|s| s.to_string()).collect(),
            value,
            conv: TimeConv::None,
        }
    }

    pub fn with_conv(self, conv: TimeConv) -> Expr {
        match self {
            Expr::Cmp {
                op, path, value, ..
            } => Expr::Cmp {
                op,
                path,
                value,
                conv,
            },
            other => other,
        }
    }
}

type Interval = (usize, usize);

/// Sort and merge touching or overlapping intervals.
fn compress(mut iv: Vec<Interval>) -> Vec<Interval> {
    iv.retain(|(s, e)| e > s);
    iv.sort_unstable();
    let mut out: Vec<Interval> = Vec::with_capacity(iv.len());
    for (s, e) in iv {
        match out.last_mut() {
            Some((_, pe)) if s <= *pe => *pe = (*pe).max(e),
            _ => out.push((s, e)),
        }
    }
    out
}

fn intersect(a: &[Interval], b: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        let s = a[i].0.max(b[j].0);
        let e = a[i].1.min(b[j].1);
        if s < e {
            out.push((s, e));
        }
        if a[i].1 <= b[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

fn complement(iv: &[Interval], blocks: usize) -> Vec<Interval> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    for (s, e) in iv {
        if *s > cursor {
            out.push((cursor, *s));
        }
        cursor = cursor.max(*e);
    }
    if cursor < blocks {
        out.push((cursor, blocks));
    }
    out
}

fn datum_eq(a: &OwnedDatum, b: &OwnedDatum) -> bool {
    match (a, b) {
        (OwnedDatum::Int(x), OwnedDatum::Float(y))
        | (OwnedDatum::Float(y), OwnedDatum::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

/// A compiled filter. `None` is the trivial filter matching everything.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    expr: Option<Expr>,
}

impl Filter {
    pub fn new(expr: Option<Expr>) -> Self {
        Filter { expr }
    }

    pub fn all() -> Self {
        Filter { expr: None }
    }

    pub fn trivial(&self) -> bool {
        self.expr.is_none()
    }

    fn full(si: &SparseIndex) -> Vec<Interval> {
        if si.blocks() == 0 {
            Vec::new()
        } else {
            vec![(0, si.blocks())]
        }
    }

    fn eval(&self, si: &SparseIndex) -> Vec<Interval> {
        match &self.expr {
            None => Self::full(si),
            Some(e) => compress(Self::eval_expr(e, si)),
        }
    }

    fn time_interval(si: &SparseIndex, path: &[String], op: CmpOp, lo: i64, hi: i64) -> Vec<Interval> {
        // [lo, hi] is the inclusive microsecond range equal to the
        // compared value; comparisons reduce to envelope lookups
        let ti = match si.time_index(path) {
            Some(ti) => ti,
            None => return Self::full(si),
        };
        let blocks = si.blocks();
        let iv = match op {
            CmpOp::Le => (0, ti.end(hi)),
            CmpOp::Lt => (0, ti.end(lo.saturating_sub(1))),
            CmpOp::Ge => (ti.start(lo), blocks),
            CmpOp::Gt => (ti.start(hi.saturating_add(1)), blocks),
            CmpOp::Eq => (ti.start(lo), ti.end(hi.saturating_add(1))),
        };
        if iv.0 < iv.1 { vec![iv] } else { Vec::new() }
    }

    fn const_eval(si: &SparseIndex, path: &[String], keep: impl Fn(&OwnedDatum) -> bool) -> Vec<Interval> {
        match si.const_val(&path.join(".")) {
            Some(v) if !keep(v) => Vec::new(),
            _ => Self::full(si),
        }
    }

    fn eval_expr(e: &Expr, si: &SparseIndex) -> Vec<Interval> {
        match e {
            Expr::Cmp {
                op,
                path,
                value,
                conv,
            } => match (conv, value) {
                (TimeConv::None, OwnedDatum::Timestamp(t)) => {
                    Self::time_interval(si, path, *op, *t, *t)
                }
                (TimeConv::UnixMicro, OwnedDatum::Int(n)) => {
                    Self::time_interval(si, path, *op, *n, *n)
                }
                (TimeConv::UnixEpoch, OwnedDatum::Int(n)) => {
                    let lo = n.saturating_mul(MICROS_PER_SEC);
                    let hi = lo.saturating_add(MICROS_PER_SEC - 1);
                    Self::time_interval(si, path, *op, lo, hi)
                }
                _ => match op {
                    // equality against a packfile constant can prune
                    CmpOp::Eq => Self::const_eval(si, path, |c| datum_eq(c, value)),
                    _ => Self::full(si),
                },
            },
            Expr::In { path, set } => {
                Self::const_eval(si, path, |c| set.iter().any(|v| datum_eq(c, v)))
            }
            Expr::And(parts) => {
                let mut acc = Self::full(si);
                for p in parts {
                    let rhs = compress(Self::eval_expr(p, si));
                    acc = intersect(&acc, &rhs);
                    if acc.is_empty() {
                        break;
                    }
                }
                acc
            }
            Expr::Or(parts) => {
                let mut acc = Vec::new();
                for p in parts {
                    acc.extend(Self::eval_expr(p, si));
                }
                compress(acc)
            }
            Expr::Not(inner) => {
                let iv = compress(Self::eval_expr(inner, si));
                complement(&iv, si.blocks())
            }
        }
    }

    /// Invoke `f(start, end)` for every matching block interval. When no
    /// range matches, `f(0, 0)` is invoked exactly once so callers can
    /// detect the empty case.
    pub fn visit(&self, si: &SparseIndex, mut f: impl FnMut(usize, usize)) {
        let iv = self.eval(si);
        if iv.is_empty() {
            f(0, 0);
            return;
        }
        for (s, e) in iv {
            f(s, e);
        }
    }

    /// True when at least one block may match.
    pub fn matches_any(&self, si: &SparseIndex) -> bool {
        if self.trivial() {
            return true;
        }
        !self.eval(si).is_empty()
    }

    /// True when the result covers every block.
    pub fn matches_all(&self, si: &SparseIndex) -> bool {
        if self.trivial() {
            return true;
        }
        self.eval(si) == Self::full(si)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_path() -> Vec<&'static str> {
        vec!["ts"]
    }

    /// 10 blocks, block k covers [k*1000, k*1000+999].
    fn sample() -> SparseIndex {
        let mut si = SparseIndex::default();
        for k in 0..10i64 {
            si.push(&[String::from("ts")], k * 1000, k * 1000 + 999);
            si.bump();
        }
        si.set_const("tenant", OwnedDatum::String("acme".into()));
        si
    }

    fn ranges(f: &Filter, si: &SparseIndex) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        f.visit(si, |s, e| out.push((s, e)));
        out
    }

    #[test]
    fn le_ge_eq() {
        let si = sample();
        let f = Filter::new(Some(Expr::cmp(
            CmpOp::Le,
            &ts_path(),
            OwnedDatum::Timestamp(2500),
        )));
        assert_eq!(ranges(&f, &si), vec![(0, 3)]);

        let f = Filter::new(Some(Expr::cmp(
            CmpOp::Ge,
            &ts_path(),
            OwnedDatum::Timestamp(7500),
        )));
        assert_eq!(ranges(&f, &si), vec![(7, 10)]);

        let f = Filter::new(Some(Expr::cmp(
            CmpOp::Eq,
            &ts_path(),
            OwnedDatum::Timestamp(4321),
        )));
        assert_eq!(ranges(&f, &si), vec![(4, 5)]);
    }

    #[test]
    fn and_or_not() {
        let si = sample();
        let ge = Expr::cmp(CmpOp::Ge, &ts_path(), OwnedDatum::Timestamp(2000));
        let le = Expr::cmp(CmpOp::Le, &ts_path(), OwnedDatum::Timestamp(4999));
        let f = Filter::new(Some(Expr::And(vec![ge.clone(), le.clone()])));
        assert_eq!(ranges(&f, &si), vec![(2, 5)]);

        let lo = Expr::cmp(CmpOp::Le, &ts_path(), OwnedDatum::Timestamp(999));
        let hi = Expr::cmp(CmpOp::Ge, &ts_path(), OwnedDatum::Timestamp(9000));
        let f = Filter::new(Some(Expr::Or(vec![lo, hi])));
        assert_eq!(ranges(&f, &si), vec![(0, 1), (9, 10)]);

        let f = Filter::new(Some(Expr::Not(Box::new(Expr::And(vec![ge, le])))));
        assert_eq!(ranges(&f, &si), vec![(0, 2), (5, 10)]);
    }

    #[test]
    fn empty_match_calls_once_with_zero() {
        let si = sample();
        let f = Filter::new(Some(Expr::And(vec![
            Expr::cmp(CmpOp::Le, &ts_path(), OwnedDatum::Timestamp(999)),
            Expr::cmp(CmpOp::Ge, &ts_path(), OwnedDatum::Timestamp(5000)),
        ])));
        assert_eq!(ranges(&f, &si), vec![(0, 0)]);
        assert!(!f.matches_any(&si));
    }

    #[test]
    fn const_equality_prunes() {
        let si = sample();
        let hit = Filter::new(Some(Expr::cmp(
            CmpOp::Eq,
            &["tenant"],
            OwnedDatum::String("acme".into()),
        )));
        assert_eq!(ranges(&hit, &si), vec![(0, 10)]);

        let miss = Filter::new(Some(Expr::cmp(
            CmpOp::Eq,
            &["tenant"],
            OwnedDatum::String("other".into()),
        )));
        assert_eq!(ranges(&miss, &si), vec![(0, 0)]);

        // unknown field: unprunable
        let unknown = Filter::new(Some(Expr::cmp(
            CmpOp::Eq,
            &["color"],
            OwnedDatum::String("red".into()),
        )));
        assert_eq!(ranges(&unknown, &si), vec![(0, 10)]);
    }

    #[test]
    fn in_set_prunes_constants() {
        let si = sample();
        let f = Filter::new(Some(Expr::In {
            path: vec!["tenant".to_string()],
            set: vec![
                OwnedDatum::String("zed".into()),
                OwnedDatum::String("acme".into()),
            ],
        }));
        assert!(f.matches_any(&si));
        let f = Filter::new(Some(Expr::In {
            path: vec!["tenant".to_string()],
            set: vec![OwnedDatum::String("zed".into())],
        }));
        assert!(!f.matches_any(&si));
    }

    #[test]
    fn epoch_conversions_reduce_to_micros() {
        let mut si = SparseIndex::default();
        // blocks of one second each
        for k in 0..5i64 {
            si.push(
                &[String::from("ts")],
                k * MICROS_PER_SEC,
                (k + 1) * MICROS_PER_SEC - 1,
            );
            si.bump();
        }
        let f = Filter::new(Some(
            Expr::cmp(CmpOp::Eq, &ts_path(), OwnedDatum::Int(3)).with_conv(TimeConv::UnixEpoch),
        ));
        let iv = ranges(&f, &si);
        // block 3 must be covered; blocks before it must be pruned
        assert!(iv.iter().any(|(s, e)| *s <= 3 && 3 < *e));
        for k in 0..3 {
            assert!(!iv.iter().any(|(s, e)| *s <= k && k < *e), "block {k} kept");
        }

        let f = Filter::new(Some(
            Expr::cmp(
                CmpOp::Ge,
                &ts_path(),
                OwnedDatum::Int(2 * MICROS_PER_SEC + 17),
            )
            .with_conv(TimeConv::UnixMicro),
        ));
        assert_eq!(ranges(&f, &si), vec![(2, 5)]);
    }

    #[test]
    fn conservative_over_coalesced_index() {
        // overlapping pushes coalesce the max side; lookups must still
        // cover every block that could match (property: no false
        // negatives)
        let mut si = SparseIndex::default();
        let spans = [(0i64, 5000i64), (100, 4000), (200, 3000), (6000, 9000)];
        for (lo, hi) in spans.iter() {
            si.push(&[String::from("ts")], *lo, *hi);
            si.bump();
        }
        for (k, (lo, hi)) in spans.iter().enumerate() {
            for probe in [*lo, (*lo + *hi) / 2, *hi] {
                let f = Filter::new(Some(Expr::cmp(
                    CmpOp::Eq,
                    &ts_path(),
                    OwnedDatum::Timestamp(probe),
                )));
                let iv = ranges(&f, &si);
                assert!(
                    iv.iter().any(|(s, e)| *s <= k && k < *e),
                    "block {k} dropped for probe {probe}: {iv:?}"
                );
            }
        }
    }
}
