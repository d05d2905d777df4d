use anyhow::{Context, Result};
use log::{info, warn};

use reverie_dialogue::play::{self, TerminalRenderer};
use reverie_dialogue::{scenario, ConversationConfig, ConversationTree, FileStore, TreeDefinition};

const SAVE_KEY: &str = "session";

fn main() -> Result<()> {
    // Control verbosity with RUST_LOG:
    //   RUST_LOG=info   cargo run                 # start/end/save/load
    //   RUST_LOG=debug  cargo run -- tree.json    # + transitions and context merges
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).is_some_and(|a| a == "-h" || a == "--help") {
        println!(
            "Usage: reverie-dialogue [tree.json] [save-dir] [config.json]\n\
             \n\
             Without a tree file the built-in Reverie House welcome is played.\n\
             Saves go to <save-dir>/{SAVE_KEY}.json (default ./.reverie).\n\
             \n\
             Logging: set RUST_LOG=debug for transitions"
        );
        return Ok(());
    }

    let config = match args.get(3) {
        Some(path) => ConversationConfig::from_path(path)
            .with_context(|| format!("failed to read config {path}"))?,
        None => ConversationConfig::default(),
    };
    let save_dir = args.get(2).map(String::as_str).unwrap_or(".reverie");

    let mut engine = ConversationTree::new(config)
        .with_renderer(TerminalRenderer)
        .with_store(FileStore::new(save_dir));

    match args.get(1) {
        Some(path) => {
            let tree = TreeDefinition::from_path(path)
                .with_context(|| format!("failed to load tree {path}"))?;
            for (from, to) in tree.missing_targets() {
                warn!("Node '{from}' links to unknown node '{to}'");
            }
            engine.register_tree(path.as_str(), tree);
        }
        None => scenario::register_reverie_welcome(&mut engine),
    }

    info!("Saving to {save_dir}");
    play::run(&mut engine, SAVE_KEY)
}
