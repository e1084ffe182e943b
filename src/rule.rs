//! Rewrite rules.
//!
//! A rule pairs an input pattern to match with an output pattern to write.
//! Patterns are parsed from strings like `"RB,WW"`:
//! - each character is a symbol of the grid alphabet (or a declared union)
//! - `,` separates rows (Y), `/` separates planes (Z)
//! - `*` in an input matches any value; `*` in an output writes nothing

use super::Grid;
use std::fmt;

/// "Don't write" sentinel in output patterns.
pub const NO_WRITE: u8 = 0xff;

/// A rewrite rule with a wave-mask input pattern and a value output pattern.
#[derive(Clone)]
pub struct Rule {
    /// Input pattern as wave bitmasks (wildcards and unions allowed)
    pub input: Vec<u32>,
    /// Output pattern as values; [`NO_WRITE`] leaves the cell untouched
    pub output: Vec<u8>,
    /// Compacted input: the single matched value per cell, [`NO_WRITE`] for
    /// full wildcards. Used by potential propagation.
    pub binput: Vec<u8>,
    /// Input box dimensions
    pub imx: usize,
    pub imy: usize,
    pub imz: usize,
    /// Output box dimensions
    pub omx: usize,
    pub omy: usize,
    pub omz: usize,
    /// Selection weight
    pub p: f64,
    /// Alphabet size the patterns were built against
    pub c: u8,
    /// `ishifts[v]` = offsets within the input pattern at which value `v` is
    /// accepted; the trigger table for incremental matching
    pub ishifts: Vec<Vec<(i32, i32, i32)>>,
    /// `oshifts[v]` = offsets at which the output writes `v` (populated only
    /// when input and output boxes coincide)
    pub oshifts: Vec<Vec<(i32, i32, i32)>>,
    /// True for the rule as written; false for symmetry duplicates
    pub original: bool,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("input", &format!("[{}x{}x{}]", self.imx, self.imy, self.imz))
            .field("output", &format!("[{}x{}x{}]", self.omx, self.omy, self.omz))
            .field("p", &self.p)
            .field("original", &self.original)
            .finish()
    }
}

/// Error type for rule parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    /// Pattern string is empty
    EmptyPattern,
    /// Rows or planes disagree on dimensions
    NonRectangularPattern,
    /// Symbol not declared in the grid alphabet
    UnknownSymbol(char),
    /// Input and output boxes disagree on dimensions
    DimensionMismatch,
}

impl fmt::Display for RuleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleParseError::EmptyPattern => write!(f, "empty pattern"),
            RuleParseError::NonRectangularPattern => write!(f, "non-rectangular pattern"),
            RuleParseError::UnknownSymbol(c) => write!(f, "unknown symbol '{}'", c),
            RuleParseError::DimensionMismatch => {
                write!(f, "input and output dimensions don't match")
            }
        }
    }
}

impl std::error::Error for RuleParseError {}

impl Rule {
    /// Build a rule directly from pattern arrays, computing the derived
    /// tables (`binput`, `ishifts`, `oshifts`). The result is marked as a
    /// symmetry variant; [`Rule::parse`] marks the as-written rule.
    #[allow(clippy::too_many_arguments)]
    pub fn from_patterns(
        input: Vec<u32>,
        imx: usize,
        imy: usize,
        imz: usize,
        output: Vec<u8>,
        omx: usize,
        omy: usize,
        omz: usize,
        c: u8,
        p: f64,
    ) -> Self {
        let wildcard = (1u32 << c) - 1;
        let binput: Vec<u8> = input
            .iter()
            .map(|&w| {
                if w == wildcard {
                    NO_WRITE
                } else {
                    w.trailing_zeros() as u8
                }
            })
            .collect();

        let mut ishifts: Vec<Vec<(i32, i32, i32)>> = vec![Vec::new(); c as usize];
        for z in 0..imz {
            for y in 0..imy {
                for x in 0..imx {
                    let idx = x + y * imx + z * imx * imy;
                    let mut w = input[idx];
                    for value in 0..c as usize {
                        if (w & 1) == 1 {
                            ishifts[value].push((x as i32, y as i32, z as i32));
                        }
                        w >>= 1;
                    }
                }
            }
        }

        let oshifts = if omx == imx && omy == imy && omz == imz {
            let mut oshifts: Vec<Vec<(i32, i32, i32)>> = vec![Vec::new(); c as usize];
            for z in 0..omz {
                for y in 0..omy {
                    for x in 0..omx {
                        let idx = x + y * omx + z * omx * omy;
                        let o = output[idx];
                        if o != NO_WRITE {
                            if (o as usize) < oshifts.len() {
                                oshifts[o as usize].push((x as i32, y as i32, z as i32));
                            }
                        } else {
                            for value in 0..c as usize {
                                oshifts[value].push((x as i32, y as i32, z as i32));
                            }
                        }
                    }
                }
            }
            oshifts
        } else {
            Vec::new()
        };

        Self {
            input,
            output,
            binput,
            imx,
            imy,
            imz,
            omx,
            omy,
            omz,
            p,
            c,
            ishifts,
            oshifts,
            original: false,
        }
    }

    /// Parse a rule from input/output pattern strings against a grid's
    /// alphabet. The boxes must agree on dimensions. The result is marked
    /// [`Rule::original`].
    pub fn parse(input_str: &str, output_str: &str, grid: &Grid) -> Result<Self, RuleParseError> {
        let (in_chars, imx, imy, imz) = parse_pattern(input_str)?;
        let (out_chars, omx, omy, omz) = parse_pattern(output_str)?;

        if imx != omx || imy != omy || imz != omz {
            return Err(RuleParseError::DimensionMismatch);
        }

        let mut input = Vec::with_capacity(in_chars.len());
        for ch in &in_chars {
            match grid.waves.get(ch) {
                Some(&wave) => input.push(wave),
                None => return Err(RuleParseError::UnknownSymbol(*ch)),
            }
        }

        let mut output = Vec::with_capacity(out_chars.len());
        for ch in &out_chars {
            if *ch == '*' {
                output.push(NO_WRITE);
            } else if let Some(&value) = grid.values.get(ch) {
                output.push(value);
            } else {
                return Err(RuleParseError::UnknownSymbol(*ch));
            }
        }

        let mut rule = Self::from_patterns(input, imx, imy, imz, output, omx, omy, omz, grid.c, 1.0);
        rule.original = true;
        Ok(rule)
    }

    /// Rotate the XY plane 90 degrees counter-clockwise around Z.
    pub fn z_rotated(&self) -> Self {
        let mut new_input = vec![0u32; self.input.len()];
        let mut new_output = vec![0u8; self.output.len()];

        let new_imx = self.imy;
        let new_imy = self.imx;
        let new_omx = self.omy;
        let new_omy = self.omx;

        for z in 0..self.imz {
            for y in 0..new_imy {
                for x in 0..new_imx {
                    let new_idx = x + y * new_imx + z * new_imx * new_imy;
                    let old_idx = (self.imx - 1 - y) + x * self.imx + z * self.imx * self.imy;
                    new_input[new_idx] = self.input[old_idx];
                }
            }
        }
        for z in 0..self.omz {
            for y in 0..new_omy {
                for x in 0..new_omx {
                    let new_idx = x + y * new_omx + z * new_omx * new_omy;
                    let old_idx = (self.omx - 1 - y) + x * self.omx + z * self.omx * self.omy;
                    new_output[new_idx] = self.output[old_idx];
                }
            }
        }

        Self::from_patterns(
            new_input, new_imx, new_imy, self.imz, new_output, new_omx, new_omy, self.omz, self.c,
            self.p,
        )
    }

    /// Rotate the XZ plane 90 degrees around Y: `(x, y, z) -> (z, y, imx-1-x)`.
    pub fn y_rotated(&self) -> Self {
        let mut new_input = vec![0u32; self.input.len()];
        let mut new_output = vec![0u8; self.output.len()];

        let new_imx = self.imz;
        let new_imy = self.imy;
        let new_imz = self.imx;
        let new_omx = self.omz;
        let new_omy = self.omy;
        let new_omz = self.omx;

        for z in 0..new_imz {
            for y in 0..new_imy {
                for x in 0..new_imx {
                    let new_idx = x + y * new_imx + z * new_imx * new_imy;
                    let old_idx = (self.imx - 1 - z) + y * self.imx + x * self.imx * self.imy;
                    new_input[new_idx] = self.input[old_idx];
                }
            }
        }
        for z in 0..new_omz {
            for y in 0..new_omy {
                for x in 0..new_omx {
                    let new_idx = x + y * new_omx + z * new_omx * new_omy;
                    let old_idx = (self.omx - 1 - z) + y * self.omx + x * self.omx * self.omy;
                    new_output[new_idx] = self.output[old_idx];
                }
            }
        }

        Self::from_patterns(
            new_input, new_imx, new_imy, new_imz, new_output, new_omx, new_omy, new_omz, self.c,
            self.p,
        )
    }

    /// Mirror along the X axis.
    pub fn reflected(&self) -> Self {
        let mut new_input = vec![0u32; self.input.len()];
        let mut new_output = vec![0u8; self.output.len()];

        for z in 0..self.imz {
            for y in 0..self.imy {
                for x in 0..self.imx {
                    let new_idx = x + y * self.imx + z * self.imx * self.imy;
                    let old_idx = (self.imx - 1 - x) + y * self.imx + z * self.imx * self.imy;
                    new_input[new_idx] = self.input[old_idx];
                }
            }
        }
        for z in 0..self.omz {
            for y in 0..self.omy {
                for x in 0..self.omx {
                    let new_idx = x + y * self.omx + z * self.omx * self.omy;
                    let old_idx = (self.omx - 1 - x) + y * self.omx + z * self.omx * self.omy;
                    new_output[new_idx] = self.output[old_idx];
                }
            }
        }

        Self::from_patterns(
            new_input, self.imx, self.imy, self.imz, new_output, self.omx, self.omy, self.omz,
            self.c, self.p,
        )
    }

    /// Canonical equality: same boxes, same patterns.
    pub fn same(&self, other: &Self) -> bool {
        self.imx == other.imx
            && self.imy == other.imy
            && self.imz == other.imz
            && self.omx == other.omx
            && self.omy == other.omy
            && self.omz == other.omz
            && self.input == other.input
            && self.output == other.output
    }
}

/// Parse a pattern string into symbols and box dimensions.
///
/// Returns `(chars, mx, my, mz)` with chars in `x + y*mx + z*mx*my` order.
/// Planes in the string go from the top of the box down, so they are stored
/// reversed: the last plane in the string lands at `z = 0`.
fn parse_pattern(s: &str) -> Result<(Vec<char>, usize, usize, usize), RuleParseError> {
    if s.is_empty() {
        return Err(RuleParseError::EmptyPattern);
    }

    let planes: Vec<&str> = s.split('/').collect();
    let mz = planes.len();

    let first_rows: Vec<&str> = planes[0].split(',').collect();
    let my = first_rows.len();
    let mx = first_rows[0].chars().count();
    if mx == 0 {
        return Err(RuleParseError::EmptyPattern);
    }

    let mut result = vec![' '; mx * my * mz];
    for z in 0..mz {
        let plane = planes[mz - 1 - z];
        let rows: Vec<&str> = plane.split(',').collect();
        if rows.len() != my {
            return Err(RuleParseError::NonRectangularPattern);
        }
        for (y, row) in rows.iter().enumerate() {
            if row.chars().count() != mx {
                return Err(RuleParseError::NonRectangularPattern);
            }
            for (x, ch) in row.chars().enumerate() {
                result[x + y * mx + z * mx * my] = ch;
            }
        }
    }

    Ok((result, mx, my, mz))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(s: &str) -> (Vec<char>, usize, usize, usize) {
        parse_pattern(s).unwrap()
    }

    #[test]
    fn parse_pattern_1d() {
        let (chars, mx, my, mz) = pattern("BW");
        assert_eq!(chars, vec!['B', 'W']);
        assert_eq!((mx, my, mz), (2, 1, 1));
    }

    #[test]
    fn parse_pattern_2d_row_order() {
        let (chars, mx, my, mz) = pattern("RB,WW");
        assert_eq!((mx, my, mz), (2, 2, 1));
        assert_eq!(chars, vec!['R', 'B', 'W', 'W']);
    }

    #[test]
    fn parse_pattern_3d_reverses_planes() {
        // "AB/CD": plane "CD" (last in the string) lands at z=0
        let (chars, mx, my, mz) = pattern("AB/CD");
        assert_eq!((mx, my, mz), (2, 1, 2));
        assert_eq!(chars, vec!['C', 'D', 'A', 'B']);
    }

    #[test]
    fn parse_pattern_rejects_ragged_rows() {
        assert_eq!(
            parse_pattern("AB,C"),
            Err(RuleParseError::NonRectangularPattern)
        );
        assert_eq!(
            parse_pattern("AB,CD/A,B"),
            Err(RuleParseError::NonRectangularPattern)
        );
    }

    #[test]
    fn rule_parse_simple() {
        let grid = Grid::with_alphabet(5, 5, 1, "BW");
        let rule = Rule::parse("B", "W", &grid).unwrap();

        assert_eq!((rule.imx, rule.imy, rule.imz), (1, 1, 1));
        assert_eq!(rule.input[0], 1);
        assert_eq!(rule.output[0], 1);
        assert!(rule.original);
        assert_eq!(rule.ishifts[0], vec![(0, 0, 0)]);
        assert!(rule.ishifts[1].is_empty());
        assert_eq!(rule.oshifts[1], vec![(0, 0, 0)]);
    }

    #[test]
    fn rule_parse_wildcards() {
        let grid = Grid::with_alphabet(5, 5, 1, "BW");

        let input_wild = Rule::parse("*", "W", &grid).unwrap();
        assert_eq!(input_wild.input[0], 3);
        assert_eq!(input_wild.binput[0], NO_WRITE);

        let output_wild = Rule::parse("BW", "W*", &grid).unwrap();
        assert_eq!(output_wild.output[0], 1);
        assert_eq!(output_wild.output[1], NO_WRITE);
    }

    #[test]
    fn rule_parse_union_input() {
        let mut grid = Grid::with_alphabet(5, 5, 1, "BRG");
        grid.add_union('?', "RG").unwrap();
        let rule = Rule::parse("?", "B", &grid).unwrap();
        assert_eq!(rule.input[0], 0b110);
        // both union members trigger the same anchor
        assert_eq!(rule.ishifts[1], vec![(0, 0, 0)]);
        assert_eq!(rule.ishifts[2], vec![(0, 0, 0)]);
    }

    #[test]
    fn rule_parse_unknown_symbol() {
        let grid = Grid::with_alphabet(5, 5, 1, "BW");
        assert_eq!(
            Rule::parse("X", "W", &grid).unwrap_err(),
            RuleParseError::UnknownSymbol('X')
        );
    }

    #[test]
    fn rule_parse_dimension_mismatch() {
        let grid = Grid::with_alphabet(5, 5, 1, "BW");
        assert_eq!(
            Rule::parse("BW", "W", &grid).unwrap_err(),
            RuleParseError::DimensionMismatch
        );
    }

    #[test]
    fn rule_z_rotation_swaps_box() {
        let grid = Grid::with_alphabet(5, 5, 1, "ABCD");
        let rule = Rule::parse("AB", "CD", &grid).unwrap();
        let rotated = rule.z_rotated();
        assert_eq!((rotated.imx, rotated.imy), (1, 2));
        assert!(!rotated.original);
        // four z-rotations come back around
        let back = rotated.z_rotated().z_rotated().z_rotated();
        assert!(back.same(&rule));
    }

    #[test]
    fn rule_reflection_mirrors_content() {
        let grid = Grid::with_alphabet(5, 5, 1, "ABCD");
        let rule = Rule::parse("AB", "CD", &grid).unwrap();
        let reflected = rule.reflected();
        assert_eq!(reflected.input[0], rule.input[1]);
        assert_eq!(reflected.input[1], rule.input[0]);
        assert!(reflected.reflected().same(&rule));
    }

    #[test]
    fn rule_y_rotation_permutes_axes() {
        let grid = Grid::with_alphabet(5, 5, 5, "ABCD");
        let rule = Rule::parse("ABC", "CBA", &grid).unwrap();
        assert_eq!((rule.imx, rule.imy, rule.imz), (3, 1, 1));
        let rotated = rule.y_rotated();
        assert_eq!((rotated.imx, rotated.imy, rotated.imz), (1, 1, 3));
        let back = rotated.y_rotated().y_rotated().y_rotated();
        assert!(back.same(&rule));
    }

    #[test]
    fn rule_same_compares_patterns() {
        let grid = Grid::with_alphabet(5, 5, 1, "BW");
        let a = Rule::parse("BW", "WB", &grid).unwrap();
        let b = Rule::parse("BW", "WB", &grid).unwrap();
        let c = Rule::parse("WB", "BW", &grid).unwrap();
        assert!(a.same(&b));
        assert!(!a.same(&c));
    }
}
