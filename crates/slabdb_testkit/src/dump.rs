//! Textual dumps of a snapshot's logical content.
//!
//! Two snapshots with the same tables, columns, keys, indexes and objects
//! produce the same dump regardless of where their nodes live in the file,
//! which makes dumps the thing to compare after an upgrade that was cut
//! off and resumed.

use slabdb_core::{CoreResult, LinkTarget, Transaction};

/// Renders every table of the snapshot `tr` sees, in table key order.
///
/// # Errors
///
/// Returns an error if the transaction is not attached or a table cannot
/// be decoded.
pub fn dump_layout(tr: &Transaction) -> CoreResult<String> {
    let mut out = format!("file format {}\n", tr.file_format_version());
    let mut keys = tr.get_table_keys();
    keys.sort();

    for key in keys {
        let name = tr.table_name(key)?;
        let data = tr.table_data(key)?;
        out.push_str(&format!(
            "table {name} key={key} asymmetric={} objects={}\n",
            data.is_asymmetric(),
            data.size()
        ));
        for col in data.columns() {
            let col_key = col.key.map_or_else(|| "-".to_string(), |k| k.to_string());
            let target = match col.target {
                LinkTarget::None => String::new(),
                LinkTarget::Position(pos) => format!(" -> #{pos}"),
                LinkTarget::Table(table) => format!(" -> {}", tr.table_name(table)?),
            };
            let indexed = col.key.is_some_and(|k| data.has_search_index(k));
            let primary = col.key.is_some() && col.key == data.primary_key();
            out.push_str(&format!(
                "  column {} {:?} key={col_key} attrs={}{target}{}{}\n",
                col.name,
                col.col_type,
                col.attrs,
                if indexed { " indexed" } else { "" },
                if primary { " primary" } else { "" },
            ));
        }
        for row in data.rows() {
            out.push_str(&format!("  object {} {:?}\n", row.key, row.values));
        }
    }
    Ok(out)
}
