//! Compressed alignment columns.
//!
//! A [`SitePatterns`] holds the unique columns of an alignment with
//! multiplicities, so the likelihood engine evaluates each distinct
//! column once and weights it by its count.

use std::collections::HashMap;

use vireo_core::{Result, VireoError};

/// Maps sequence characters to integer state codes.
///
/// Codes in `0..state_count` are definite states; anything the coder
/// cannot resolve maps to `state_count`, the missing-data sentinel
/// that gives a uniform tip partial.
pub trait StateCoder {
    fn state_count(&self) -> usize;
    fn code(&self, c: u8) -> usize;
}

/// The four nucleotides; everything else (gaps, IUPAC ambiguity
/// codes, `N`) is treated as missing.
#[derive(Debug, Clone, Copy)]
pub struct NucleotideCoder;

impl StateCoder for NucleotideCoder {
    fn state_count(&self) -> usize {
        4
    }

    fn code(&self, c: u8) -> usize {
        match c.to_ascii_uppercase() {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' | b'U' => 3,
            _ => 4,
        }
    }
}

/// Two-state characters coded as `0`/`1`; anything else is missing.
#[derive(Debug, Clone, Copy)]
pub struct BinaryCoder;

impl StateCoder for BinaryCoder {
    fn state_count(&self) -> usize {
        2
    }

    fn code(&self, c: u8) -> usize {
        match c {
            b'0' => 0,
            b'1' => 1,
            _ => 2,
        }
    }
}

/// Unique alignment columns with weights, taxon-major state access.
#[derive(Debug, Clone)]
pub struct SitePatterns {
    state_count: usize,
    taxa: Vec<String>,
    // patterns[p][taxon] is a state code, state_count meaning missing.
    patterns: Vec<Vec<usize>>,
    weights: Vec<f64>,
}

impl SitePatterns {
    /// Compress aligned sequences into unique weighted columns.
    ///
    /// Sequences must be non-empty and of equal length; columns are
    /// kept in first-appearance order.
    pub fn new(coder: &dyn StateCoder, sequences: &[(&str, &[u8])]) -> Result<Self> {
        if sequences.is_empty() {
            return Err(VireoError::InvalidInput("alignment has no sequences".into()));
        }
        let site_count = sequences[0].1.len();
        if site_count == 0 {
            return Err(VireoError::InvalidInput("alignment has no sites".into()));
        }
        for (taxon, seq) in sequences {
            if seq.len() != site_count {
                return Err(VireoError::InvalidInput(format!(
                    "sequence for {} has {} sites, expected {}",
                    taxon,
                    seq.len(),
                    site_count
                )));
            }
        }

        let taxa: Vec<String> = sequences.iter().map(|(t, _)| t.to_string()).collect();
        let mut patterns: Vec<Vec<usize>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut seen: HashMap<Vec<usize>, usize> = HashMap::new();

        for site in 0..site_count {
            let column: Vec<usize> = sequences
                .iter()
                .map(|(_, seq)| coder.code(seq[site]))
                .collect();
            match seen.get(&column) {
                Some(&p) => weights[p] += 1.0,
                None => {
                    seen.insert(column.clone(), patterns.len());
                    patterns.push(column);
                    weights.push(1.0);
                }
            }
        }

        Ok(Self {
            state_count: coder.state_count(),
            taxa,
            patterns,
            weights,
        })
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn taxon_label(&self, taxon: usize) -> &str {
        &self.taxa[taxon]
    }

    /// Index of a taxon by label.
    pub fn taxon_index(&self, label: &str) -> Option<usize> {
        self.taxa.iter().position(|t| t == label)
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Multiplicity of pattern `p` in the original alignment.
    pub fn weight(&self, p: usize) -> f64 {
        self.weights[p]
    }

    /// State code of `taxon` in pattern `p`; `state_count` means
    /// missing.
    pub fn state(&self, taxon: usize, p: usize) -> usize {
        self.patterns[p][taxon]
    }

    /// Total number of sites across all patterns.
    pub fn site_count(&self) -> f64 {
        self.weights.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_identical_columns() {
        let p = SitePatterns::new(
            &NucleotideCoder,
            &[("A", b"ACCA"), ("B", b"ACCA"), ("C", b"GTTG")],
        )
        .unwrap();
        assert_eq!(p.pattern_count(), 2);
        assert_eq!(p.weight(0), 2.0); // columns 0 and 3
        assert_eq!(p.weight(1), 2.0); // columns 1 and 2
        assert_eq!(p.site_count(), 4.0);
        assert_eq!(p.state(0, 0), 0);
        assert_eq!(p.state(2, 0), 2);
        assert_eq!(p.state(2, 1), 3);
    }

    #[test]
    fn preserves_first_appearance_order() {
        let p = SitePatterns::new(&NucleotideCoder, &[("A", b"TGCA")]).unwrap();
        assert_eq!(p.pattern_count(), 4);
        assert_eq!(p.state(0, 0), 3);
        assert_eq!(p.state(0, 3), 0);
    }

    #[test]
    fn ambiguity_maps_to_missing() {
        let p = SitePatterns::new(&NucleotideCoder, &[("A", b"AN-R")]).unwrap();
        assert_eq!(p.state(0, 0), 0);
        for pat in 1..p.pattern_count() {
            assert_eq!(p.state(0, pat), 4);
        }
        // All-unresolved columns compress together.
        assert_eq!(p.pattern_count(), 2);
        assert_eq!(p.weight(1), 3.0);
    }

    #[test]
    fn binary_coding() {
        let p = SitePatterns::new(&BinaryCoder, &[("A", b"01?")]).unwrap();
        assert_eq!(p.state_count(), 2);
        assert_eq!(p.state(0, 0), 0);
        assert_eq!(p.state(0, 1), 1);
        assert_eq!(p.state(0, 2), 2);
    }

    #[test]
    fn taxon_lookup() {
        let p = SitePatterns::new(&NucleotideCoder, &[("gi|1", b"A"), ("gi|2", b"C")]).unwrap();
        assert_eq!(p.taxon_index("gi|2"), Some(1));
        assert_eq!(p.taxon_index("gi|3"), None);
        assert_eq!(p.taxon_label(0), "gi|1");
    }

    #[test]
    fn ragged_alignment_rejected() {
        let r = SitePatterns::new(&NucleotideCoder, &[("A", b"ACG"), ("B", b"AC")]);
        assert!(r.is_err());
    }

    #[test]
    fn empty_alignment_rejected() {
        assert!(SitePatterns::new(&NucleotideCoder, &[]).is_err());
        assert!(SitePatterns::new(&NucleotideCoder, &[("A", b"")]).is_err());
    }
}
