use chrono::{Local, Timelike};
use serde_json::json;

use crate::conversation::condition::Condition;
use crate::conversation::node::{Choice, DialogueLine, DialogueSource, Node, TreeDefinition};
use crate::conversation::{Context, ConversationTree};

pub const TREE_NAME: &str = "reverie_welcome";

const HOST: &str = "errantson";
const HOST_AVATAR: &str = "/souvenirs/dream/strange/icon.png";

fn host(text: &str) -> DialogueLine {
    DialogueLine::new(text)
        .with_speaker(HOST)
        .with_avatar(HOST_AVATAR)
}

// ---------------------------------------------------------------------------
// Reverie House welcome
// ---------------------------------------------------------------------------

/// Greeting matching the local hour.
fn greeting_for(hour: u32) -> &'static str {
    match hour {
        5..=11 => "Good morning",
        12..=17 => "Good afternoon",
        _ => "Good evening",
    }
}

/// Register the welcome tree and its context provider on `engine`.
pub fn register_reverie_welcome(engine: &mut ConversationTree) {
    engine.register_context_provider("guest", |engine| {
        let mut context = Context::new();
        context.insert("greeting".into(), json!(greeting_for(Local::now().hour())));
        context.insert("dreamer".into(), engine.get_variable("dreamer", "dreamer"));
        Ok(context)
    });

    engine.register_tree(TREE_NAME, reverie_welcome());
}

pub fn reverie_welcome() -> TreeDefinition {
    TreeDefinition::new()
        .with_root("welcome")
        .with_node(
            "welcome",
            Node::choice(
                host("{{greeting}}, {{dreamer}}. Welcome to Reverie House. What brings you here?"),
                [
                    Choice::new("I had a dream")
                        .with_id("dream")
                        .set_variable("purpose", "dream")
                        .with_target("dream"),
                    Choice::new("Just looking around")
                        .with_id("tour")
                        .set_variable("purpose", "tour")
                        .with_target("tour"),
                    Choice::new("Leave").with_id("leave").secondary().with_target("farewell"),
                ],
            )
            .with_context_provider("guest"),
        )
        .with_node(
            "dream",
            Node::choice(
                host("Tell me about it. What happened?"),
                [
                    Choice::new("I was falling")
                        .set_variable("dream", "falling")
                        .with_target("record"),
                    Choice::new("I was flying")
                        .set_variable("dream", "flying")
                        .with_target("record"),
                    Choice::new("I don't remember")
                        .set_variable("dream", "forgotten")
                        .rotating(false)
                        .with_target("record"),
                ],
            )
            .with_rotating_text(["{{dreamer}} tries to remember...", "the details slip away..."])
            .with_context_provider("guest"),
        )
        .with_node(
            "record",
            Node::line(
                host("A {{dream}} dream. I'll add it to the book. That makes {{dreams_recorded}}.")
                    .with_variant(
                        Condition::equals("dream", "forgotten"),
                        "Forgotten dreams still count. That makes {{dreams_recorded}}.",
                    ),
            )
            .on_enter(|engine| {
                let recorded = engine.get_variable("dreams_recorded", 0).as_i64().unwrap_or(0);
                engine.set_variable("dreams_recorded", recorded + 1);
                Ok(())
            })
            .with_next("crossroads"),
        )
        .with_node(
            "crossroads",
            Node::choice(
                host("Where to next, {{dreamer}}?"),
                [
                    Choice::new("Tour the house").with_target("tour"),
                    Choice::new("Record another dream").with_target("dream"),
                    Choice::new("Join the keepers")
                        .with_condition(Condition::greater_than("dreams_recorded", 1))
                        .set_flag("keeper")
                        .with_target("keepers"),
                    Choice::new("Leave").secondary().with_target("farewell"),
                ],
            )
            .with_context_provider("guest"),
        )
        .with_node(
            "tour",
            Node::line(host("This is the library. Every dream anyone has told us is shelved here."))
                .with_condition(Condition::not(Condition::flag("toured")))
                .with_fallback("tour_again")
                .on_enter(|engine| {
                    engine.set_flag("toured");
                    Ok(())
                })
                .with_next("crossroads"),
        )
        .with_node(
            "tour_again",
            Node::line(host("You've seen the house already, {{dreamer}}. It hasn't moved."))
                .with_context_provider("guest")
                .with_next("crossroads"),
        )
        .with_node(
            "keepers",
            Node::line(host("Welcome, keeper. The night shift starts whenever you fall asleep."))
                .with_continue_text("THANK YOU")
                .with_next("crossroads"),
        )
        .with_node(
            "farewell",
            Node::sequence([
                DialogueSource::from(
                    host("Sleep well, {{dreamer}}.")
                        .with_variant(Condition::flag("keeper"), "Sleep well, keeper {{dreamer}}."),
                ),
                DialogueSource::dynamic(|engine, _context| {
                    let choices = engine.choice_history().len();
                    Ok(host(&format!(
                        "You made {choices} choice{} tonight.",
                        if choices == 1 { "" } else { "s" }
                    )))
                }),
            ])
            .with_context_provider("guest"),
        )
}
