//! ECC Map Registry
//!
//! Declarative XOR schemes. Each scheme names, for every parity fragment,
//! the data fragments XORed into it. The registry is immutable and shared;
//! the codec is generic over whatever map it is handed.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Prefix used by the built-in scheme names
pub const MAP_PREFIX: &str = "ecc/";

/// Scheme used when nothing is configured
pub const DEFAULT_MAP: &str = "ecc/4x4";

// =============================================================================
// ECC Map
// =============================================================================

/// An immutable XOR incidence map between data and parity fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccMap {
    name: String,
    data_to_parity: Vec<Vec<usize>>,
    parity_to_data: Vec<Vec<usize>>,
    correctable_errors: usize,
    fire_hire_errors: usize,
}

/// Summary of a scheme as returned by `describe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EccDescription {
    pub name: String,
    pub data_fragments: usize,
    pub parity_fragments: usize,
    pub data_to_parity: Vec<Vec<usize>>,
}

impl EccMap {
    /// Build a map from its parity → data sets, validating every invariant
    ///
    /// `data_fragments` is `D`; the number of parity sets is `P`.
    pub fn from_parity_sets(
        name: impl Into<String>,
        data_fragments: usize,
        parity_sets: Vec<Vec<usize>>,
    ) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: String| Error::InvalidEccMap {
            name: name.clone(),
            reason,
        };

        if data_fragments == 0 {
            return Err(invalid("scheme must have at least one data fragment".into()));
        }
        if parity_sets.is_empty() {
            return Err(invalid("scheme must have at least one parity fragment".into()));
        }

        let mut data_to_parity = vec![Vec::new(); data_fragments];
        for (parity, set) in parity_sets.iter().enumerate() {
            if set.is_empty() {
                return Err(invalid(format!("parity {} has no contributors", parity)));
            }
            for (pos, &data) in set.iter().enumerate() {
                if data >= data_fragments {
                    return Err(invalid(format!(
                        "parity {} references data index {} (D={})",
                        parity, data, data_fragments
                    )));
                }
                if set[..pos].contains(&data) {
                    return Err(invalid(format!(
                        "parity {} lists data index {} twice",
                        parity, data
                    )));
                }
                data_to_parity[data].push(parity);
            }
        }

        if let Some(orphan) = data_to_parity.iter().position(|p| p.is_empty()) {
            return Err(invalid(format!(
                "data index {} contributes to no parity",
                orphan
            )));
        }

        let parity_to_data: Vec<Vec<usize>> = parity_sets
            .into_iter()
            .map(|mut set| {
                set.sort_unstable();
                set
            })
            .collect();

        // The inverse must cover every parity exactly once.
        if parity_to_data.len() != inverse_parity_count(&data_to_parity) {
            return Err(invalid("parity count disagrees with inverse map".into()));
        }

        Ok(Self {
            name,
            data_to_parity,
            parity_to_data,
            correctable_errors: 1,
            fire_hire_errors: 1,
        })
    }

    fn with_tolerances(mut self, correctable: usize, fire_hire: usize) -> Self {
        self.correctable_errors = correctable;
        self.fire_hire_errors = fire_hire;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of data fragments (`D`)
    pub fn data_fragments(&self) -> usize {
        self.data_to_parity.len()
    }

    /// Number of parity fragments (`P`)
    pub fn parity_fragments(&self) -> usize {
        self.parity_to_data.len()
    }

    /// `D + P`, which is also the family size
    pub fn total_fragments(&self) -> usize {
        self.data_fragments() + self.parity_fragments()
    }

    /// Parities the given data fragment contributes to, ascending
    pub fn data_to_parity(&self, data: usize) -> &[usize] {
        &self.data_to_parity[data]
    }

    /// Data fragments XORed into the given parity, ascending
    pub fn parity_to_data(&self, parity: usize) -> &[usize] {
        &self.parity_to_data[parity]
    }

    /// Number of lost suppliers the scheme is designed to survive
    pub fn correctable_errors(&self) -> usize {
        self.correctable_errors
    }

    /// Maximum automatic supplier replacements allowed at once
    pub fn fire_hire_errors(&self) -> usize {
        self.fire_hire_errors
    }

    pub fn describe(&self) -> EccDescription {
        EccDescription {
            name: self.name.clone(),
            data_fragments: self.data_fragments(),
            parity_fragments: self.parity_fragments(),
            data_to_parity: self.data_to_parity.clone(),
        }
    }

    /// Lowest parity that can rebuild `missing` given the present fragments
    ///
    /// A parity qualifies when it is present and every other data fragment
    /// feeding it is present.
    pub fn data_fix_path(
        &self,
        missing: usize,
        data_present: &[bool],
        parity_present: &[bool],
    ) -> Option<usize> {
        self.data_to_parity[missing].iter().copied().find(|&parity| {
            parity_present[parity]
                && self.parity_to_data[parity]
                    .iter()
                    .all(|&other| other == missing || data_present[other])
        })
    }

    /// Whether every data fragment can be recovered from the present set
    pub fn is_fixable(&self, data_present: &[bool], parity_present: &[bool]) -> bool {
        self.unrecoverable_data(data_present, parity_present).is_empty()
    }

    /// Data indices that stay missing after iterative recovery
    pub fn unrecoverable_data(&self, data_present: &[bool], parity_present: &[bool]) -> Vec<usize> {
        let mut data = data_present.to_vec();
        loop {
            let mut progressed = false;
            for i in 0..self.data_fragments() {
                if !data[i] && self.data_fix_path(i, &data, parity_present).is_some() {
                    data[i] = true;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        data.iter()
            .enumerate()
            .filter(|(_, present)| !**present)
            .map(|(i, _)| i)
            .collect()
    }
}

fn inverse_parity_count(data_to_parity: &[Vec<usize>]) -> usize {
    data_to_parity
        .iter()
        .flat_map(|set| set.iter().copied())
        .max()
        .map(|p| p + 1)
        .unwrap_or(0)
}

// =============================================================================
// Built-in Schemes
// =============================================================================

const ECC_2X2: &[&[usize]] = &[
    &[1],
    &[0],
];

const ECC_4X4: &[&[usize]] = &[
    &[1, 2, 3],
    &[0, 2],
    &[0, 3],
    &[0, 1],
];

const ECC_7X7: &[&[usize]] = &[
    &[3, 4, 6],
    &[0, 4, 5],
    &[1, 5, 6],
    &[0, 2, 6],
    &[0, 1, 3],
    &[1, 2, 4],
    &[2, 3, 5],
];

const ECC_13X13: &[&[usize]] = &[
    &[1, 4, 8, 12],
    &[5, 8, 9, 11],
    &[3, 7, 10, 11],
    &[0, 4, 6, 9],
    &[2, 3, 6, 12],
    &[0, 1, 6, 10],
    &[1, 3, 7, 9],
    &[2, 5, 8, 12],
    &[2, 4, 7, 11],
    &[0, 1, 3, 5, 12],
    &[6, 7, 8],
    &[2, 5, 9, 10],
    &[0, 4, 10, 11],
];

const ECC_18X18: &[&[usize]] = &[
    &[5, 7, 11, 16, 17],
    &[2, 9, 11, 13, 17],
    &[5, 8, 9, 13, 15],
    &[0, 1, 4, 6, 10],
    &[2, 3, 12, 13, 14],
    &[6, 8, 13, 17],
    &[2, 5, 10, 12],
    &[3, 10, 11, 14],
    &[0, 1, 3, 4, 5, 6, 7, 9, 10, 11, 13, 14, 15, 16, 17],
    &[0, 1, 12, 14],
    &[5, 6, 8, 14, 16],
    &[0, 4, 7, 9],
    &[2, 4, 7, 8],
    &[3, 4, 6, 11, 15],
    &[0, 10, 15, 16],
    &[1, 2, 17],
    &[3, 8, 12, 15],
    &[1, 7, 9, 12, 16],
];

const ECC_26X26: &[&[usize]] = &[
    &[1, 8, 11, 16, 19, 21],
    &[3, 6, 8, 17, 23],
    &[6, 7, 11, 17, 21, 25],
    &[0, 10, 13, 14, 21],
    &[5, 9, 10, 18, 22],
    &[12, 13, 17, 20, 21, 22],
    &[1, 2, 9, 13],
    &[2, 3, 5, 9, 20, 22],
    &[0, 6, 9, 12, 15, 25],
    &[2, 7, 14, 15, 16, 24],
    &[2, 5, 6, 11, 15, 16, 18, 19, 23],
    &[2, 10, 12, 13, 14, 20, 23],
    &[0, 3, 4, 11, 19],
    &[0, 1, 4, 18, 19, 20, 23, 25],
    &[1, 5, 7, 11, 20, 21, 25],
    &[1, 4, 16, 17, 18],
    &[2, 4, 11, 22, 24],
    &[5, 12, 13, 14, 16, 24],
    &[3, 7, 10, 20, 22, 24, 25],
    &[0, 8, 10, 12, 17],
    &[0, 8, 9, 17, 19, 22, 25],
    &[4, 5, 15, 16, 22],
    &[6, 8, 12, 14, 15, 18, 23],
    &[1, 3, 7, 13, 19, 24],
    &[0, 3, 4, 7, 14, 15, 21, 23],
    &[6, 8, 9, 10, 18, 24],
];

const ECC_64X64: &[&[usize]] = &[
    &[5, 17, 18, 31, 39, 47, 55, 58],
    &[0, 3, 4, 25, 27, 32, 34, 48, 53, 56, 63],
    &[10, 11, 17, 18, 25, 32, 36, 40, 45, 51],
    &[1, 21, 23, 27, 30, 35, 43, 47, 62],
    &[2, 19, 20, 21, 28, 29, 37, 38, 40, 55, 56, 62],
    &[15, 17, 19, 20, 31, 45, 46, 54, 57, 63],
    &[19, 20, 30, 36, 46, 47, 52, 62],
    &[2, 5, 16, 18, 19, 37, 48, 55],
    &[1, 2, 7, 12, 13, 20, 26, 28, 48, 55],
    &[0, 1, 15, 21, 24, 33, 36, 41, 56, 62],
    &[19, 20, 28, 30, 43, 45, 52, 57, 59],
    &[2, 6, 12, 20, 34, 58, 61, 63],
    &[5, 6, 13, 15, 25, 34, 36, 40, 42, 43, 50, 51, 55, 61, 62],
    &[21, 22, 23, 34, 39, 41, 43, 45, 49, 52, 53, 58],
    &[0, 12, 17, 19, 28, 57, 58, 63],
    &[8, 18, 25, 29, 34, 49, 52, 53, 56, 62],
    &[3, 6, 19, 23, 35, 39, 40, 43, 49, 54, 57],
    &[2, 3, 8, 9, 30, 31, 47, 54, 58, 62],
    &[0, 8, 14, 24, 28, 33, 36, 47, 52, 58],
    &[8, 10, 13, 22, 25, 27, 32, 35, 40, 51, 56],
    &[2, 14, 16, 17, 26, 27, 29, 31, 43, 46, 54, 56],
    &[22, 25, 37, 41, 45, 52, 61],
    &[5, 9, 13, 32, 46, 50, 54, 62],
    &[0, 4, 5, 10, 15, 16, 26, 36, 37, 48, 50],
    &[13, 14, 20, 21, 40, 42, 55, 60],
    &[1, 2, 13, 15, 16, 19, 26, 30, 37, 42, 48, 50, 59],
    &[4, 10, 11, 18, 28, 30, 44, 45, 46, 60, 63],
    &[2, 6, 16, 22, 24, 38, 41, 53, 59],
    &[6, 15, 21, 23, 26, 29, 32, 34, 35, 36, 38, 43, 51, 54, 60],
    &[13, 24, 32, 33, 34, 41, 46, 52, 58, 61],
    &[1, 10, 23, 24, 27, 29, 40, 41, 61],
    &[4, 5, 6, 10, 14, 42, 44, 48, 51, 53, 61],
    &[0, 5, 7, 15, 49, 50],
    &[8, 29, 35, 36, 43, 47, 51, 60, 62],
    &[7, 12, 15, 21, 22, 27, 31, 33, 57, 60],
    &[5, 16, 18, 24, 26, 33, 38, 44, 46, 53, 56, 57, 61],
    &[1, 3, 4, 9, 24, 27, 31, 39, 50, 51, 54, 58],
    &[12, 18, 22, 23, 27, 35, 36, 44, 60, 63],
    &[0, 12, 17, 20, 32, 35, 37, 50, 53, 59],
    &[8, 11, 14, 16, 22, 24, 35, 36, 41, 42, 44, 46, 57],
    &[14, 23, 30, 33, 34, 38, 42, 44, 46, 48, 54],
    &[9, 14, 27, 31, 33, 35, 49, 51, 52, 54],
    &[3, 8, 11, 12, 14, 30, 32, 34, 48, 56, 62],
    &[7, 9, 29, 44, 46, 58],
    &[6, 18, 21, 26, 28, 39, 40, 45, 47, 55, 58, 63],
    &[4, 17, 21, 26, 30, 34, 54, 61],
    &[0, 5, 6, 10, 23, 29, 39, 55, 60],
    &[7, 9, 10, 11, 12, 18, 25, 26, 29, 37, 38, 39, 42, 45, 49],
    &[6, 7, 17, 27, 33, 56, 59, 60],
    &[1, 3, 9, 14, 20, 28, 42, 47, 57, 63],
    &[11, 17, 23, 25, 39, 41, 45, 53, 56, 57, 60, 61, 63],
    &[4, 8, 12, 16, 19, 28, 31, 32, 47],
    &[2, 4, 22, 23, 26, 39, 41, 42, 51, 59],
    &[0, 3, 9, 13, 25, 40, 43],
    &[0, 9, 10, 16, 22, 47, 53, 55],
    &[1, 3, 4, 7, 13, 20, 21, 25, 49, 50],
    &[6, 12, 15, 16, 17, 29, 33, 38, 48, 50, 55, 57, 59],
    &[1, 15, 24, 28, 37, 40, 42, 52],
    &[1, 4, 7, 13, 14, 30, 38, 59],
    &[11, 31, 33, 37, 44, 49, 51, 52],
    &[8, 11, 24, 31, 32, 35, 50, 53, 59, 63],
    &[3, 8, 11, 18, 22, 38, 44, 49],
    &[7, 9, 10, 19, 37, 41, 44, 45, 49, 60, 61],
    &[2, 3, 5, 7, 11, 38, 39, 43, 48, 59],
];

/// (name, suppliers, parity sets, correctable errors, fire-hire errors)
const BUILTIN: &[(&str, usize, &[&[usize]], usize, usize)] = &[
    ("ecc/2x2", 2, ECC_2X2, 1, 1),
    ("ecc/4x4", 4, ECC_4X4, 2, 1),
    ("ecc/7x7", 7, ECC_7X7, 3, 2),
    ("ecc/13x13", 13, ECC_13X13, 4, 2),
    ("ecc/18x18", 18, ECC_18X18, 5, 2),
    ("ecc/26x26", 26, ECC_26X26, 6, 3),
    ("ecc/64x64", 64, ECC_64X64, 10, 5),
];

static REGISTRY: Lazy<EccRegistry> = Lazy::new(EccRegistry::load_builtin);

// =============================================================================
// Registry
// =============================================================================

/// Named, immutable collection of ECC maps
#[derive(Debug, Default)]
pub struct EccRegistry {
    maps: BTreeMap<String, Arc<EccMap>>,
    by_suppliers: BTreeMap<usize, String>,
}

impl EccRegistry {
    /// The process-wide registry of built-in schemes
    pub fn builtin() -> &'static EccRegistry {
        &REGISTRY
    }

    fn load_builtin() -> Self {
        Self::from_table(BUILTIN)
    }

    fn from_table(table: &[(&str, usize, &[&[usize]], usize, usize)]) -> Self {
        let mut registry = Self::default();
        for &(name, suppliers, sets, correctable, fire_hire) in table {
            let parity_sets = sets.iter().map(|s| s.to_vec()).collect();
            match EccMap::from_parity_sets(name, suppliers, parity_sets) {
                Ok(map) => {
                    registry.insert(map.with_tolerances(correctable, fire_hire), Some(suppliers))
                }
                Err(e) => warn!(map = name, error = %e, "Skipping invalid ECC map"),
            }
        }
        registry
    }

    /// Register a map, optionally as the scheme for a supplier count
    pub fn insert(&mut self, map: EccMap, suppliers: Option<usize>) {
        if let Some(n) = suppliers {
            self.by_suppliers.insert(n, map.name().to_string());
        }
        self.maps.insert(map.name().to_string(), Arc::new(map));
    }

    /// Find a scheme by name; `4x4` is accepted for `ecc/4x4`
    pub fn lookup(&self, name: &str) -> Result<Arc<EccMap>> {
        let qualified = if name.starts_with(MAP_PREFIX) {
            name.to_string()
        } else {
            format!("{}{}", MAP_PREFIX, name)
        };
        self.maps
            .get(&qualified)
            .or_else(|| self.maps.get(name))
            .cloned()
            .ok_or_else(|| Error::UnknownMap(name.to_string()))
    }

    /// Scheme registered for exactly `suppliers` data fragments
    pub fn for_suppliers(&self, suppliers: usize) -> Result<Arc<EccMap>> {
        let name = self
            .by_suppliers
            .get(&suppliers)
            .ok_or_else(|| {
                Error::UnknownMap(format!(
                    "no scheme for {} suppliers (schemes exist for {:?})",
                    suppliers,
                    self.supplier_counts()
                ))
            })?;
        self.lookup(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.maps.keys().map(String::as_str).collect()
    }

    /// Supplier counts that have a registered scheme, ascending
    pub fn supplier_counts(&self) -> Vec<usize> {
        self.by_suppliers.keys().copied().collect()
    }
}

/// Look up a built-in scheme by name
pub fn lookup(name: &str) -> Result<Arc<EccMap>> {
    EccRegistry::builtin().lookup(name)
}

// =============================================================================
// Tests
// =============================================================================
