use crate::instrumentation_profile::error::InstrProfError;
use rustc_hash::FxHashMap;
use tracing::warn;

/// Maps names to a canonical spelling. Two names are treated as the same symbol when their
/// canonical spellings are equal.
pub trait NameRemapper {
    fn canonicalize(&self, name: &str) -> String;
}

impl<F> NameRemapper for F
where
    F: Fn(&str) -> String,
{
    fn canonicalize(&self, name: &str) -> String {
        self(name)
    }
}

/// Remaps names by declaring fragments of mangled names equivalent, i.e. after renaming the type
/// `3bar` to `4quux` the rule `name 3bar 4quux` makes `_Z3barf` and `_Z4quuxf` the same symbol.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentRemapper {
    /// (fragment, representative), longest fragment first
    fragments: Vec<(String, String)>,
}

impl FragmentRemapper {
    /// Every pair joins the equivalence classes of its two fragments, the first fragment of the
    /// earliest pair becomes the representative of the class.
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut classes: FxHashMap<String, String> = FxHashMap::default();
        for (a, b) in pairs {
            let (a, b) = (a.into(), b.into());
            if a.is_empty() || b.is_empty() {
                continue;
            }
            let rep_a = classes.get(&a).cloned().unwrap_or_else(|| a.clone());
            let rep_b = classes.get(&b).cloned().unwrap_or_else(|| b.clone());
            classes.insert(a, rep_a.clone());
            classes.insert(b, rep_b.clone());
            if rep_a != rep_b {
                for rep in classes.values_mut() {
                    if *rep == rep_b {
                        *rep = rep_a.clone();
                    }
                }
            }
        }
        let mut fragments = classes.into_iter().collect::<Vec<_>>();
        fragments.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { fragments }
    }

    /// Reads a remapping file. Each line is `<kind> <fragment> <fragment>` with `kind` one of
    /// `name`, `type` or `encoding`, blank lines and lines starting with `#` are ignored.
    pub fn parse(text: &str) -> Result<Self, InstrProfError> {
        let mut pairs = vec![];
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts = line.split_whitespace().collect::<Vec<_>>();
            match parts.as_slice() {
                [kind, a, b] if matches!(*kind, "name" | "type" | "encoding") => {
                    pairs.push((a.to_string(), b.to_string()));
                }
                _ => {
                    warn!("Invalid remapping rule on line {}: {}", i + 1, line);
                    return Err(InstrProfError::Malformed);
                }
            }
        }
        Ok(Self::new(pairs))
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

impl NameRemapper for FragmentRemapper {
    fn canonicalize(&self, name: &str) -> String {
        let mut result = String::with_capacity(name.len());
        let mut rest = name;
        'outer: while !rest.is_empty() {
            for (fragment, rep) in &self.fragments {
                if rest.starts_with(fragment.as_str()) {
                    result.push_str(rep);
                    rest = &rest[fragment.len()..];
                    continue 'outer;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                result.push(c);
            }
            rest = chars.as_str();
        }
        result
    }
}
