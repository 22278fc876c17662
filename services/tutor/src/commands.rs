//! Parsing of the terminal client's input lines.
//!
//! Lines starting with `/` are commands; anything else is a question for the
//! tutor.

use rulebook_core::LessonTrigger;
use rulebook_core::settings::{AiProvider, SpeechEngine, Voice};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Quit,
    List,
    Add(PathBuf),
    Open(String),
    Rename(String),
    Delete,
    Trigger(LessonTrigger),
    Stages,
    Ask(String),
    Messages,
    Play(usize),
    Stop,
    Clear,
    Settings,
    SetProvider(AiProvider),
    SetCustomProvider {
        base_url: String,
        api_key: String,
        model: String,
    },
    SetEngine(SpeechEngine),
    SetVoice(Voice),
    SetAutoPlay(bool),
    SetRate(f32),
    Search(String),
    Fetch(usize),
    Microphone,
}

pub const HELP: &str = "\
/list                       show your games
/add <file.pdf | image dir> add a rulebook
/open <number | id>         open a game
/rename <name>              rename the open game
/delete                     delete the open game
/explain /continue /again /restart
                            lesson controls
/stages                     the order a lesson follows
/messages                   show the conversation
/play <number>              read a message aloud
/stop                       stop audio
/clear                      clear the conversation
/settings                   show settings
/set provider gemini|claude
/set provider custom <base url> <api key> <model>
/set engine cloud|local
/set voice cherry|ethan|dylan|nofish
/set autoplay on|off
/set rate 1|1.25|1.5|1.75|2
/search <game name>         find rulebooks online
/fetch <number>             add a search result
/mic                        voice input
/quit
Anything else is sent to the tutor as a question.";

/// Parses one input line. `Ok(None)` means there is nothing to do.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Command::Ask(line.to_string())));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    let parsed = match name.to_lowercase().as_str() {
        "help" | "h" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        "list" | "ls" => Command::List,
        "add" => Command::Add(PathBuf::from(required(rest, "a file or directory")?)),
        "open" => Command::Open(required(rest, "a game number or id")?.to_string()),
        "rename" => Command::Rename(required(rest, "a new name")?.to_string()),
        "delete" => Command::Delete,
        "explain" => Command::Trigger(LessonTrigger::Explain),
        "continue" | "next" => Command::Trigger(LessonTrigger::Continue),
        "again" => Command::Trigger(LessonTrigger::NotUnderstood),
        "restart" => Command::Trigger(LessonTrigger::Restart),
        "stages" => Command::Stages,
        "ask" => Command::Ask(required(rest, "a question")?.to_string()),
        "messages" | "log" => Command::Messages,
        "play" => Command::Play(number(rest)?),
        "stop" => Command::Stop,
        "clear" => Command::Clear,
        "settings" => Command::Settings,
        "set" => parse_setting(rest)?,
        "search" => Command::Search(required(rest, "a game name")?.to_string()),
        "fetch" => Command::Fetch(number(rest)?),
        "mic" => Command::Microphone,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(parsed))
}

fn parse_setting(rest: &str) -> Result<Command, String> {
    let mut words = rest.split_whitespace();
    let key = words.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = words.collect();

    match (key.as_str(), args.as_slice()) {
        ("provider", ["gemini"]) => Ok(Command::SetProvider(AiProvider::Gemini)),
        ("provider", ["claude"]) => Ok(Command::SetProvider(AiProvider::Claude)),
        ("provider", ["custom", base_url, api_key, model]) => Ok(Command::SetCustomProvider {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }),
        ("engine", ["cloud"]) => Ok(Command::SetEngine(SpeechEngine::Cloud)),
        ("engine", ["local"]) => Ok(Command::SetEngine(SpeechEngine::Local)),
        ("voice", [voice]) => voice
            .parse::<Voice>()
            .map(Command::SetVoice)
            .map_err(|e| e.to_string()),
        ("autoplay", ["on"]) => Ok(Command::SetAutoPlay(true)),
        ("autoplay", ["off"]) => Ok(Command::SetAutoPlay(false)),
        ("rate", [rate]) => rate
            .parse::<f32>()
            .map(Command::SetRate)
            .map_err(|_| format!("not a number: {rate}")),
        _ => Err("unrecognised setting, try /help".to_string()),
    }
}

fn required<'a>(rest: &'a str, what: &str) -> Result<&'a str, String> {
    if rest.is_empty() {
        Err(format!("expected {what}"))
    } else {
        Ok(rest)
    }
}

/// A 1-based list position.
fn number(rest: &str) -> Result<usize, String> {
    match rest.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("expected a number from the list, got {rest:?}")),
    }
}
