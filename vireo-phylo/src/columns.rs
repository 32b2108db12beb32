//! Read-only log columns: labelled formatted values for samplers and
//! host applications to write wherever they like. Nothing here
//! touches the filesystem.

use crate::likelihood::TreeLikelihood;
use crate::parameter::Parameter;
use crate::tree::Tree;

/// A labelled value rendered for one sample row.
pub trait LogColumn {
    fn label(&self) -> &str;
    fn value(&self) -> String;
}

/// A real-valued column with fixed decimal places.
pub struct RealColumn {
    label: String,
    value: f64,
    decimals: usize,
}

impl RealColumn {
    pub fn new(label: &str, value: f64) -> Self {
        Self::with_decimals(label, value, 4)
    }

    pub fn with_decimals(label: &str, value: f64, decimals: usize) -> Self {
        Self {
            label: label.to_string(),
            value,
            decimals,
        }
    }
}

impl LogColumn for RealColumn {
    fn label(&self) -> &str {
        &self.label
    }

    fn value(&self) -> String {
        if self.value.is_finite() {
            format!("{:.*}", self.decimals, self.value)
        } else {
            format!("{}", self.value)
        }
    }
}

/// A preformatted text column.
pub struct TextColumn {
    label: String,
    value: String,
}

impl TextColumn {
    pub fn new(label: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            value: value.to_string(),
        }
    }
}

impl LogColumn for TextColumn {
    fn label(&self) -> &str {
        &self.label
    }

    fn value(&self) -> String {
        self.value.clone()
    }
}

/// Column for the last evaluated log-likelihood; `NaN` if the cache
/// is invalid.
pub fn likelihood_column(likelihood: &TreeLikelihood) -> RealColumn {
    RealColumn::new(
        likelihood.id(),
        likelihood.last_log_likelihood().unwrap_or(f64::NAN),
    )
}

/// One column per dimension of a parameter, labelled `id` or `id[i]`.
pub fn parameter_columns(parameter: &Parameter) -> Vec<RealColumn> {
    let n = parameter.dimension();
    (0..n)
        .map(|i| {
            let label = if n == 1 {
                parameter.id().to_string()
            } else {
                format!("{}[{}]", parameter.id(), i)
            };
            RealColumn::new(&label, parameter.value(i))
        })
        .collect()
}

/// The root height of a tree.
pub fn tree_height_column(tree: &dyn Tree) -> RealColumn {
    RealColumn::new("rootHeight", tree.node_height(tree.root()))
}

/// Tab-separated header for a set of columns.
pub fn header_row(columns: &[&dyn LogColumn]) -> String {
    columns
        .iter()
        .map(|c| c.label())
        .collect::<Vec<_>>()
        .join("\t")
}

/// Tab-separated values for a set of columns.
pub fn value_row(columns: &[&dyn LogColumn]) -> String {
    columns
        .iter()
        .map(|c| c.value())
        .collect::<Vec<_>>()
        .join("\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree_model::tests::four_taxon_tree;

    #[test]
    fn real_column_formatting() {
        let c = RealColumn::new("logL", -123.456789);
        assert_eq!(c.label(), "logL");
        assert_eq!(c.value(), "-123.4568");
        let c = RealColumn::with_decimals("x", 1.5, 1);
        assert_eq!(c.value(), "1.5");
        let c = RealColumn::new("bad", f64::NAN);
        assert_eq!(c.value(), "NaN");
    }

    #[test]
    fn parameter_columns_label_dimensions() {
        let p = Parameter::new("kappa", vec![2.0]);
        let cols = parameter_columns(&p);
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].label(), "kappa");

        let p = Parameter::new("freqs", vec![0.25, 0.75]);
        let cols = parameter_columns(&p);
        assert_eq!(cols[0].label(), "freqs[0]");
        assert_eq!(cols[1].label(), "freqs[1]");
    }

    #[test]
    fn tree_height_reads_the_root() {
        let t = four_taxon_tree();
        let c = tree_height_column(&t);
        assert_eq!(c.label(), "rootHeight");
        assert_eq!(c.value(), "2.0000");
    }

    #[test]
    fn rows_are_tab_separated() {
        let a = TextColumn::new("state", "100");
        let b = RealColumn::with_decimals("logL", -5.0, 2);
        let cols: [&dyn LogColumn; 2] = [&a, &b];
        assert_eq!(header_row(&cols), "state\tlogL");
        assert_eq!(value_row(&cols), "100\t-5.00");
    }
}
