use crate::instrumentation_profile::symtab::Symtab;
use crate::instrumentation_profile::types::*;
use std::fmt;
use std::io::{self, Write};

/// Value profile statistics for one value kind across the functions shown.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValueSiteStats {
    total_num_value_sites: usize,
    total_value_sites_with_value_profile: usize,
    total_num_values: usize,
    /// Entry `i` counts the sites with `i + 1` values
    value_sites_histogram: Vec<usize>,
}

impl ValueSiteStats {
    /// Accumulates the sites of `func` and writes one line per value. With a symtab values are
    /// printed as the names they hash to.
    pub fn traverse_sites(
        &mut self,
        func: &InstrProfRecord,
        value: ValueKind,
        symtab: Option<&Symtab>,
        out: &mut impl Write,
    ) -> io::Result<()> {
        let num_sites = func.num_value_sites(value);
        self.total_num_value_sites += num_sites;
        for site in 0..num_sites {
            let values = func.get_value_for_site(value, site);
            if values.is_empty() {
                continue;
            }
            self.total_num_values += values.len();
            self.total_value_sites_with_value_profile += 1;
            if values.len() > self.value_sites_histogram.len() {
                self.value_sites_histogram.resize(values.len(), 0);
            }
            self.value_sites_histogram[values.len() - 1] += 1;

            let site_sum = match func.site_total_count(value, site) {
                0 => 1,
                x => x,
            };
            for v in values {
                let target = match symtab {
                    Some(symtab) => symtab
                        .get_func_or_var_name(v.value)
                        .unwrap_or_default()
                        .to_string(),
                    None => format!("{:4}", v.value),
                };
                writeln!(
                    out,
                    "\t[ {:2}, {}, {:10} ] ({:.2}%)",
                    site,
                    target,
                    v.count,
                    v.count as f64 * 100.0 / site_sum as f64
                )?;
            }
        }
        Ok(())
    }

    pub fn total_num_value_sites(&self) -> usize {
        self.total_num_value_sites
    }

    pub fn total_num_values(&self) -> usize {
        self.total_num_values
    }
}

impl fmt::Display for ValueSiteStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Total number of sites: {}", self.total_num_value_sites)?;
        writeln!(
            f,
            "  Total number of sites with values: {}",
            self.total_value_sites_with_value_profile
        )?;
        writeln!(
            f,
            "  Total number of profiled values: {}",
            self.total_num_values
        )?;
        write!(f, "  Value sites histogram:\n\tNumTargets, SiteCount")?;
        for (i, count) in self.value_sites_histogram.iter().enumerate() {
            if *count > 0 {
                write!(f, "\n\t{}, {}", i + 1, count)?;
            }
        }
        Ok(())
    }
}
