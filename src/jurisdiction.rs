// 🗺️ Jurisdiction Registry - Stable codes + alias normalization
//
// "Maharashtra", "MAHARASHTRA", "maharashtra.xlsx" and "MH" are all the
// same registration authority. The two-letter code is the identity, names
// and aliases are values that map onto it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// JURISDICTION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JurisdictionKind {
    State,
    UnionTerritory,
}

// ============================================================================
// JURISDICTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jurisdiction {
    /// Two-letter registration code, as embedded in CINs (e.g. "MH")
    pub code: String,

    /// Canonical display name
    pub canonical_name: String,

    /// Alternative spellings seen in registry dumps
    pub aliases: Vec<String>,

    pub kind: JurisdictionKind,
}

impl Jurisdiction {
    pub fn new(code: &str, canonical_name: &str, kind: JurisdictionKind) -> Self {
        Jurisdiction {
            code: code.to_string(),
            canonical_name: canonical_name.to_string(),
            aliases: Vec::new(),
            kind,
        }
    }

    /// Add an alias (ignored if already present or equal to the canonical name)
    pub fn add_alias(&mut self, alias: &str) {
        let alias = alias.to_string();
        if !self.aliases.contains(&alias) && alias != self.canonical_name {
            self.aliases.push(alias);
        }
    }

    /// Canonical name + code + aliases
    pub fn all_names(&self) -> Vec<String> {
        let mut names = vec![self.code.clone(), self.canonical_name.clone()];
        names.extend(self.aliases.clone());
        names
    }
}

/// Lowercase, treat `_`, `-` and runs of whitespace as one space.
fn match_key(value: &str) -> String {
    value
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// JURISDICTION REGISTRY
// ============================================================================

/// Registry of known registration jurisdictions.
///
/// Immutable after construction, so it can be shared across worker threads
/// without locking.
#[derive(Debug, Clone)]
pub struct JurisdictionRegistry {
    jurisdictions: Vec<Jurisdiction>,
    by_key: HashMap<String, usize>,
}

impl JurisdictionRegistry {
    /// Registry with all states and union territories
    pub fn new() -> Self {
        let mut registry = JurisdictionRegistry {
            jurisdictions: Vec::new(),
            by_key: HashMap::new(),
        };
        registry.register_defaults();
        registry
    }

    /// Empty registry (tests, custom deployments)
    pub fn empty() -> Self {
        JurisdictionRegistry {
            jurisdictions: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    fn register_defaults(&mut self) {
        use JurisdictionKind::{State, UnionTerritory};

        let defaults: &[(&str, &str, JurisdictionKind, &[&str])] = &[
            ("AP", "Andhra Pradesh", State, &[]),
            ("AR", "Arunachal Pradesh", State, &[]),
            ("AS", "Assam", State, &[]),
            ("BR", "Bihar", State, &[]),
            ("CT", "Chhattisgarh", State, &["CG", "Chattisgarh"]),
            ("GA", "Goa", State, &[]),
            ("GJ", "Gujarat", State, &["Gujrat"]),
            ("HR", "Haryana", State, &[]),
            ("HP", "Himachal Pradesh", State, &[]),
            ("JH", "Jharkhand", State, &[]),
            ("KA", "Karnataka", State, &[]),
            ("KL", "Kerala", State, &[]),
            ("MP", "Madhya Pradesh", State, &[]),
            ("MH", "Maharashtra", State, &[]),
            ("MN", "Manipur", State, &[]),
            ("ML", "Meghalaya", State, &[]),
            ("MZ", "Mizoram", State, &[]),
            ("NL", "Nagaland", State, &[]),
            ("OR", "Odisha", State, &["Orissa", "OD"]),
            ("PB", "Punjab", State, &[]),
            ("RJ", "Rajasthan", State, &[]),
            ("SK", "Sikkim", State, &[]),
            ("TN", "Tamil Nadu", State, &["Tamilnadu"]),
            ("TG", "Telangana", State, &["TS"]),
            ("TR", "Tripura", State, &[]),
            ("UP", "Uttar Pradesh", State, &[]),
            ("UR", "Uttarakhand", State, &["UK", "Uttaranchal"]),
            ("WB", "West Bengal", State, &[]),
            ("AN", "Andaman and Nicobar Islands", UnionTerritory, &["Andaman & Nicobar"]),
            ("CH", "Chandigarh", UnionTerritory, &[]),
            ("DN", "Dadra and Nagar Haveli", UnionTerritory, &[]),
            ("DD", "Daman and Diu", UnionTerritory, &[]),
            ("DL", "Delhi", UnionTerritory, &["New Delhi", "NCT of Delhi"]),
            ("JK", "Jammu and Kashmir", UnionTerritory, &["Jammu & Kashmir"]),
            ("LA", "Ladakh", UnionTerritory, &[]),
            ("LD", "Lakshadweep", UnionTerritory, &[]),
            ("PY", "Puducherry", UnionTerritory, &["Pondicherry"]),
        ];

        for (code, name, kind, aliases) in defaults {
            let mut jurisdiction = Jurisdiction::new(code, name, *kind);
            for alias in aliases.iter() {
                jurisdiction.add_alias(alias);
            }
            self.register(jurisdiction);
        }
    }

    /// Register a jurisdiction. Later registrations win on alias clashes.
    pub fn register(&mut self, jurisdiction: Jurisdiction) {
        let idx = self.jurisdictions.len();
        for name in jurisdiction.all_names() {
            self.by_key.insert(match_key(&name), idx);
        }
        self.jurisdictions.push(jurisdiction);
    }

    /// Find by code, canonical name or alias (case/separator-insensitive)
    pub fn find(&self, value: &str) -> Option<&Jurisdiction> {
        self.by_key
            .get(&match_key(value))
            .map(|idx| &self.jurisdictions[*idx])
    }

    /// Normalize any spelling to the two-letter code
    ///
    /// Example: "tamil_nadu" → "TN"
    pub fn normalize(&self, value: &str) -> Option<String> {
        self.find(value).map(|j| j.code.clone())
    }

    /// Detect a jurisdiction from a dump file name
    ///
    /// Example: "data/raw/maharashtra.xlsx" → "MH"
    pub fn detect_from_file_name(&self, file_name: &str) -> Option<String> {
        let stem = std::path::Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("");

        // Whole stem first ("tamil_nadu"), then the longest matching
        // separator-delimited prefix ("maharashtra_2024_q1" → "maharashtra").
        if let Some(code) = self.normalize(stem) {
            return Some(code);
        }

        let parts: Vec<&str> = stem
            .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .collect();
        for end in (1..parts.len()).rev() {
            let candidate = parts[..end].join(" ");
            // Two-letter prefixes are too ambiguous inside file names
            if candidate.len() <= 2 {
                continue;
            }
            if let Some(code) = self.normalize(&candidate) {
                return Some(code);
            }
        }
        None
    }

    pub fn count(&self) -> usize {
        self.jurisdictions.len()
    }

    pub fn all(&self) -> &[Jurisdiction] {
        &self.jurisdictions
    }
}

impl Default for JurisdictionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
