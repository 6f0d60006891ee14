use crate::instrumentation_profile::error::InstrProfError;
use crate::instrumentation_profile::types::*;
use crate::util::{collect_name_strings, parse_name_strings};
use std::collections::BTreeMap;

/// Name table of a profile. Resolves name hashes back to names and addresses of functions and
/// vtables to the hashes of their names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symtab {
    pub names: BTreeMap<u64, String>,
    addresses: BTreeMap<u64, u64>,
    /// vtable start address to (end address, name hash)
    vtables: BTreeMap<u64, (u64, u64)>,
}

impl Symtab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create<I, S>(names: I) -> Result<Self, InstrProfError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut symtab = Self::new();
        for name in names {
            symtab.add_func_name(name)?;
        }
        Ok(symtab)
    }

    pub fn create_from_name_strings(data: &[u8]) -> Result<Self, InstrProfError> {
        let mut symtab = Self::new();
        symtab.add_name_strings(data)?;
        Ok(symtab)
    }

    /// Adds a name returning its hash. Empty names can't be keyed and are rejected.
    pub fn add_func_name(&mut self, name: impl Into<String>) -> Result<u64, InstrProfError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InstrProfError::Malformed);
        }
        let hash = compute_hash(&name);
        self.names.insert(hash, name);
        Ok(hash)
    }

    pub fn add_name_strings(&mut self, data: &[u8]) -> Result<(), InstrProfError> {
        for name in parse_name_strings(data)? {
            self.add_func_name(name)?;
        }
        Ok(())
    }

    /// Serialises every name in the table as a single name string record.
    pub fn name_strings(&self, compress: bool) -> Result<Vec<u8>, InstrProfError> {
        let names = self.names.values().collect::<Vec<_>>();
        collect_name_strings(&names, compress)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.names.contains_key(&hash)
    }

    pub fn get(&self, hash: u64) -> Option<&String> {
        self.names.get(&hash)
    }

    /// Only an exact hash match resolves, there's no partial or fuzzy recovery of a name.
    pub fn get_func_or_var_name(&self, hash: u64) -> Option<&str> {
        self.names.get(&hash).map(|x| x.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &String)> {
        self.names.iter()
    }

    pub fn map_address(&mut self, address: u64, hash: u64) {
        self.addresses.insert(address, hash);
    }

    /// Maps every address in `[start, end)` to the vtable named by `hash`.
    pub fn map_vtable_address(&mut self, start: u64, end: u64, hash: u64) {
        if start < end {
            self.vtables.insert(start, (end, hash));
        }
    }

    /// Returns 0 for addresses that weren't mapped.
    pub fn get_function_hash_from_address(&self, address: u64) -> u64 {
        self.addresses.get(&address).copied().unwrap_or_default()
    }

    /// Returns 0 for addresses outside of every mapped vtable.
    pub fn get_vtable_hash_from_address(&self, address: u64) -> u64 {
        match self.vtables.range(..=address).next_back() {
            Some((_, (end, hash))) if address < *end => *hash,
            _ => 0,
        }
    }
}

impl ValueMapper for Symtab {
    fn map_value(&self, kind: ValueKind, value: u64) -> u64 {
        match kind {
            ValueKind::IndirectCallTarget => self.get_function_hash_from_address(value),
            ValueKind::VTableTarget => self.get_vtable_hash_from_address(value),
            ValueKind::MemOpSize => value,
        }
    }
}
