//! CLI probe for note documents.
//!
//! # Responsibility
//! - Print the outline of a plain document given as the only argument.
//! - Print the core version when called without arguments.
//! - Write core logs to `NOTETREE_LOG_DIR` when that variable is set.

use log::error;
use notetree_core::{
    core_version, default_log_level, init_logging, Document, NoteTree, StorageConfig,
};
use std::process::ExitCode;

fn print_outline(tree: &NoteTree) {
    for id in tree.preorder() {
        let (Some(node), Ok(path)) = (tree.node(id), tree.path_of(id)) else {
            continue;
        };
        let depth = path.len().saturating_sub(1);
        let marker = if tree.bookmarks().contains(id) { " *" } else { "" };
        println!(
            "{:indent$}[{id}] {} (seq {}){marker}",
            "",
            node.record().name,
            node.sequence(),
            indent = depth * 2
        );
    }
}

fn main() -> ExitCode {
    if let Ok(log_dir) = std::env::var("NOTETREE_LOG_DIR") {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    let Some(path) = std::env::args().nth(1) else {
        println!("notetree_core version={}", core_version());
        return ExitCode::SUCCESS;
    };

    match Document::open(&path, StorageConfig::default()) {
        Ok(document) => {
            print_outline(document.tree());
            println!(
                "nodes={} bookmarks={}",
                document.tree().len(),
                document.tree().bookmarks().len()
            );
            document.close();
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("event=cli_open module=cli status=error error={err}");
            eprintln!("cannot open {path}: {err}");
            ExitCode::FAILURE
        }
    }
}
