//! Human-readable renderings of the mirrored tree.

use anyhow::Result;
use serde_json::json;

use crate::store::{EntryId, EntryStore};

/// Build ASCII tree output with optional max depth limit.
///
/// Children are sorted by name at output time only; the store keeps them in
/// insertion order.
pub fn render_tree(store: &EntryStore, max_depth: Option<usize>) -> String {
    let mut output = String::new();

    let root_name = store
        .get(EntryId::ROOT)
        .map(|root| root.name.clone())
        .unwrap_or_default();
    if root_name.is_empty() {
        output.push_str("/\n");
    } else {
        output.push_str(&format!("{}\n", root_name));
    }

    print_tree(store, &mut output, EntryId::ROOT, "", 0, max_depth);

    output
}

fn print_tree(
    store: &EntryStore,
    output: &mut String,
    id: EntryId,
    prefix: &str,
    current_depth: usize,
    max_depth: Option<usize>,
) {
    if let Some(max) = max_depth {
        if current_depth >= max {
            return;
        }
    }

    let Some(entry) = store.get(id) else { return };

    let mut children: Vec<EntryId> = entry.children().to_vec();
    children.sort_by(|&a, &b| {
        let name_a = store.get(a).map(|e| e.name.as_str()).unwrap_or("");
        let name_b = store.get(b).map(|e| e.name.as_str()).unwrap_or("");
        name_a.cmp(name_b)
    });

    for (i, child_id) in children.iter().enumerate() {
        let Some(child) = store.get(*child_id) else { continue };
        let is_last_child = i == children.len() - 1;
        let branch = if is_last_child { "└── " } else { "├── " };
        let child_prefix = if is_last_child { "    " } else { "│   " };

        if child.is_folder() {
            output.push_str(&format!("{}{}{}\n", prefix, branch, child.name));
            print_tree(
                store,
                output,
                *child_id,
                &format!("{}{}", prefix, child_prefix),
                current_depth + 1,
                max_depth,
            );
        } else {
            output.push_str(&format!(
                "{}{}{} ({} bytes)\n",
                prefix,
                branch,
                child.name,
                child.file_size().unwrap_or(0)
            ));
        }
    }
}

/// Build JSON tree representation with optional max depth limit.
pub fn render_json(store: &EntryStore, max_depth: Option<usize>) -> Result<String> {
    let root = populate_json(store, EntryId::ROOT, 0, max_depth);
    Ok(serde_json::to_string_pretty(&root)?)
}

fn populate_json(
    store: &EntryStore,
    id: EntryId,
    current_depth: usize,
    max_depth: Option<usize>,
) -> serde_json::Value {
    let Some(entry) = store.get(id) else {
        return json!(null);
    };

    if entry.is_file() {
        return json!({
            "name": entry.name,
            "key": entry.key,
            "kind": "file",
            "size": entry.file_size().unwrap_or(0),
            "revision": entry.remote_revision,
        });
    }

    let mut children: Vec<serde_json::Value> = Vec::new();
    if max_depth.map(|max| current_depth < max).unwrap_or(true) {
        for &child in entry.children() {
            children.push(populate_json(store, child, current_depth + 1, max_depth));
        }
    }

    json!({
        "name": entry.name,
        "key": entry.key,
        "kind": "folder",
        "revision": entry.remote_revision,
        "children": children,
    })
}
