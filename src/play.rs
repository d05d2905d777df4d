use std::io::{self, Write};

use anyhow::Result;
use log::{error, info};
use serde_json::Value;

use crate::conversation::dialogue::{
    ButtonAction, DialogueButton, DialogueRenderer, DialogueSequence,
};
use crate::conversation::{ConversationTree, Transition};

// ---------------------------------------------------------------------------
// Terminal renderer
// ---------------------------------------------------------------------------

/// Prints each sequence to stdout with numbered buttons.
pub struct TerminalRenderer;

impl DialogueRenderer for TerminalRenderer {
    fn start(&mut self, sequence: &DialogueSequence) {
        for entry in sequence {
            match &entry.speaker {
                Some(speaker) => println!("\n[{speaker}]: {}", entry.text),
                None => println!("\n{}", entry.text),
            }
            if let Some(caption) = entry.rotating_text.first() {
                println!("  ~ {caption}");
            }
        }

        let buttons = buttons(sequence);
        if !buttons.is_empty() {
            println!();
        }
        for (i, button) in buttons.iter().enumerate() {
            let marker = if button.secondary { " (aside)" } else { "" };
            println!("  [{}] {}{marker}", i + 1, button.text);
        }
    }

    fn end(&mut self) {
        println!("\n~ the dream fades ~");
    }
}

fn buttons(sequence: &DialogueSequence) -> Vec<&DialogueButton> {
    sequence.iter().flat_map(|entry| entry.buttons.iter()).collect()
}

// ---------------------------------------------------------------------------
// Session summary
// ---------------------------------------------------------------------------

/// How a single run through the tree ended.
enum SessionOutcome {
    /// Reached a node with nothing left to press.
    Finished {
        final_node_id: String,
        choices_made: usize,
        nodes_visited: usize,
    },
    /// Player typed quit mid-conversation.
    Quit,
}

fn show_summary(outcome: &SessionOutcome) {
    println!("\n========================================");
    println!("             SESSION OVER");
    println!("========================================");

    match outcome {
        SessionOutcome::Finished {
            final_node_id,
            choices_made,
            nodes_visited,
        } => {
            println!("  Choices made : {choices_made}");
            println!("  Nodes visited: {nodes_visited}");
            println!("  Ended at     : {final_node_id}");
        }
        SessionOutcome::Quit => {
            println!("  You slipped out of Reverie House.");
        }
    }

    println!("========================================\n");
    println!("  [r] Restart    [q] Quit\n");
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Read the player's post-session choice. Returns `true` to restart.
fn prompt_restart() -> Result<bool> {
    loop {
        match read_line("> ")?.to_lowercase().as_str() {
            "r" => return Ok(true),
            "q" => return Ok(false),
            _ => println!("  Press [r] to restart or [q] to quit."),
        }
    }
}

// ---------------------------------------------------------------------------
// Single session
// ---------------------------------------------------------------------------

fn finished(engine: &mut ConversationTree) -> SessionOutcome {
    engine.end();
    SessionOutcome::Finished {
        final_node_id: engine.current_node_id().unwrap_or("-").to_string(),
        choices_made: engine.choice_history().len(),
        nodes_visited: engine.history().len(),
    }
}

/// What the session loop does after one line of input.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
    Quit,
}

fn button_actions(engine: &ConversationTree) -> Vec<ButtonAction> {
    match engine.last_sequence() {
        Some(sequence) => buttons(sequence).into_iter().map(|b| b.action.clone()).collect(),
        None => Vec::new(),
    }
}

/// Apply one command. Engine errors are reported and the player stays on the
/// current node.
fn handle_input(
    engine: &mut ConversationTree,
    input: &str,
    actions: &[ButtonAction],
    save_key: &str,
) -> Step {
    let result = match input.to_lowercase().as_str() {
        "q" | "quit" | "exit" => {
            engine.cancel();
            return Step::Quit;
        }
        "b" | "back" => engine.go_back(),
        "s" | "save" => {
            match engine.save_to_storage(save_key) {
                Ok(()) => println!("(Saved.)"),
                Err(e) => {
                    error!("Save failed: {e}");
                    println!("(Could not save.)");
                }
            }
            return Step::Continue;
        }
        "l" | "load" => {
            if !engine.load_from_storage(save_key) {
                println!("(Nothing to load.)");
                return Step::Continue;
            }
            match engine.current_node_id().map(str::to_string) {
                Some(node_id) => engine.goto_node(&node_id),
                None => return Step::Continue,
            }
        }
        other => {
            let picked = other
                .parse::<usize>()
                .ok()
                .and_then(|n| actions.get(n.wrapping_sub(1)));
            match picked {
                Some(action) => engine.press(action),
                None => {
                    println!("(Pick a number between 1 and {}.)", actions.len());
                    return Step::Continue;
                }
            }
        }
    };

    match result {
        Ok(Transition::Displayed(_) | Transition::Headless(_)) => Step::Continue,
        Ok(Transition::Parked) => {
            println!("(Nothing happens.)");
            Step::Continue
        }
        Ok(Transition::Ignored) => {
            println!("(That isn't possible right now.)");
            Step::Continue
        }
        Ok(Transition::Blocked(node_id)) => {
            println!("(The way to '{node_id}' is closed.)");
            Step::Finished
        }
        Err(e) => {
            error!("{e}");
            println!("(Nothing happens.)");
            Step::Continue
        }
    }
}

fn play_session(
    engine: &mut ConversationTree,
    dreamer: &str,
    save_key: &str,
) -> Result<SessionOutcome> {
    let transition = engine.start(None, [("dreamer", Value::from(dreamer))])?;
    info!("Session started: {transition:?}");

    loop {
        let actions = button_actions(engine);
        if actions.is_empty() {
            return Ok(finished(engine));
        }

        let input = read_line("\n[#/b(ack)/s(ave)/l(oad)/q(uit)]: ")?;
        match handle_input(engine, &input, &actions, save_key) {
            Step::Continue => {}
            Step::Finished => return Ok(finished(engine)),
            Step::Quit => return Ok(SessionOutcome::Quit),
        }
    }
}

// ---------------------------------------------------------------------------
// Public entry point: runs sessions until the player quits
// ---------------------------------------------------------------------------

pub fn run(engine: &mut ConversationTree, save_key: &str) -> Result<()> {
    loop {
        println!("\n========================================");
        println!("            REVERIE HOUSE");
        println!("========================================");

        let mut dreamer = read_line("What should we call you? ")?;
        if dreamer.is_empty() {
            dreamer = "dreamer".into();
        }

        let outcome = play_session(engine, &dreamer, save_key)?;
        show_summary(&outcome);

        if !prompt_restart()? {
            println!("Sweet dreams.");
            break;
        }

        info!("Player chose to restart");
    }

    Ok(())
}
