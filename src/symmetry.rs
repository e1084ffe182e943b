//! Symmetry closures for rewrite rules.
//!
//! A rule written once is expanded into its closure under a chosen subgroup
//! of the 8 planar or 48 cubic symmetries, so it matches in every selected
//! orientation. Duplicate variants are removed by pattern equality.
//!
//! Variant ordering is fixed so subgroup masks index consistently:
//! - square: e, r, a, ra, a², ra², a³, ra³ (a = z-rotation, r = reflection)
//! - cube: 24 rotations interleaved with their reflections; the rotations
//!   enumerate the z-rotation cosets e, b, b², b³, a·b, a³·b (b = y-rotation)
//!   each times a⁰..a³, so the first 8 entries coincide with the square
//!   ordering and the even entries are exactly the rotations.

use super::rule::Rule;

/// Number of square symmetry operations.
pub const SQUARE_OPS: usize = 8;
/// Number of cube symmetry operations.
pub const CUBE_OPS: usize = 48;

/// Resolve a symmetry subgroup name to its selection mask.
///
/// Returns `None` for names unknown in the given dimensionality. 2D names:
/// `"()"`, `"(x)"`, `"(y)"`, `"(x)(y)"`, `"(xy+)"`, `"(xy)"`. 3D names:
/// `"()"`, `"(x)"`, `"(xy)"`, `"(xyz+)"`, `"(xyz)"`.
pub fn symmetry_mask(is_2d: bool, name: &str) -> Option<Vec<bool>> {
    if is_2d {
        let mask: [bool; SQUARE_OPS] = match name {
            "()" => [true, false, false, false, false, false, false, false],
            "(x)" => [true, true, false, false, false, false, false, false],
            "(y)" => [true, false, false, false, false, true, false, false],
            "(x)(y)" => [true, true, false, false, true, true, false, false],
            "(xy+)" => [true, false, true, false, true, false, true, false],
            "(xy)" => [true; SQUARE_OPS],
            _ => return None,
        };
        Some(mask.to_vec())
    } else {
        let mask: Vec<bool> = match name {
            "()" => (0..CUBE_OPS).map(|l| l == 0).collect(),
            "(x)" => (0..CUBE_OPS).map(|l| l < 2).collect(),
            "(xy)" => (0..CUBE_OPS).map(|l| l < 8).collect(),
            "(xyz+)" => (0..CUBE_OPS).map(|l| l % 2 == 0).collect(),
            "(xyz)" => vec![true; CUBE_OPS],
            _ => return None,
        };
        Some(mask)
    }
}

/// The full-group mask: every operation selected.
pub fn full_symmetry_mask(is_2d: bool) -> Vec<bool> {
    vec![true; if is_2d { SQUARE_OPS } else { CUBE_OPS }]
}

/// All 8 square variants of a rule, in the fixed ordering.
fn square_variants(rule: &Rule) -> Vec<Rule> {
    let r0 = rule.clone();
    let r2 = r0.z_rotated();
    let r4 = r2.z_rotated();
    let r6 = r4.z_rotated();
    let r1 = r0.reflected();
    let r3 = r2.reflected();
    let r5 = r4.reflected();
    let r7 = r6.reflected();
    vec![r0, r1, r2, r3, r4, r5, r6, r7]
}

/// All 48 cube variants of a rule, in the fixed ordering.
fn cube_variants(rule: &Rule) -> Vec<Rule> {
    let mut a_pows = vec![rule.clone()];
    for _ in 0..3 {
        a_pows.push(a_pows.last().unwrap().z_rotated());
    }

    let mut variants = Vec::with_capacity(CUBE_OPS);
    for i in 0..6 {
        for base in &a_pows {
            let rot = match i {
                0 => base.clone(),
                1 => base.y_rotated(),
                2 => base.y_rotated().y_rotated(),
                3 => base.y_rotated().y_rotated().y_rotated(),
                4 => base.y_rotated().z_rotated(),
                5 => base.y_rotated().z_rotated().z_rotated().z_rotated(),
                _ => unreachable!(),
            };
            let reflected = rot.reflected();
            variants.push(rot);
            variants.push(reflected);
        }
    }
    variants
}

fn select_unique(variants: Vec<Rule>, mask: &[bool]) -> Vec<Rule> {
    let mut out: Vec<Rule> = Vec::new();
    for (i, variant) in variants.into_iter().enumerate() {
        if mask[i] && !out.iter().any(|v| v.same(&variant)) {
            out.push(variant);
        }
    }
    out
}

/// Expand a rule over the selected square symmetries, deduplicated.
///
/// The identity variant keeps its [`Rule::original`] flag; rotated and
/// reflected variants are marked as duplicates.
pub fn square_symmetries(rule: &Rule, mask: &[bool]) -> Vec<Rule> {
    debug_assert_eq!(mask.len(), SQUARE_OPS);
    select_unique(square_variants(rule), mask)
}

/// Expand a rule over the selected cube symmetries, deduplicated.
pub fn cube_symmetries(rule: &Rule, mask: &[bool]) -> Vec<Rule> {
    debug_assert_eq!(mask.len(), CUBE_OPS);
    select_unique(cube_variants(rule), mask)
}
