use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, BATCH_COMMAND, BRANCH_COMMAND, COMPOSE_COMMAND, MASK_COMMAND, NO_ARG_COMMANDS,
    REVERT_COMMAND, SETTING_COMMANDS, SINGLE_ARG_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    fn invalid(raw: &str, command: &str, message: impl Into<String>) -> Self {
        let mut intent = Self::new("invalid", raw);
        intent
            .command_args
            .insert("command".to_string(), Value::String(command.to_string()));
        intent
            .command_args
            .insert("error".to_string(), Value::String(message.into()));
        intent
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args.get(key).and_then(Value::as_str)
    }

    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        self.command_args.get(key).and_then(Value::as_i64)
    }

    pub fn arg_list(&self, key: &str) -> Vec<String> {
        self.command_args
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    parse_path_args(arg).join(" ")
}

fn string_list(items: Vec<String>) -> Value {
    Value::Array(items.into_iter().map(Value::String).collect())
}

fn parse_setting(command: &str, key: &str, action: &str, arg: &str, text: &str) -> Intent {
    if key == "image_weight" {
        return match arg.parse::<u8>() {
            Ok(weight) if weight <= 100 => {
                let mut intent = Intent::new(action, text);
                intent
                    .settings_update
                    .insert(key.to_string(), Value::from(weight));
                intent
            }
            _ => Intent::invalid(text, command, "weight must be a number from 0 to 100"),
        };
    }
    let mut intent = Intent::new(action, text);
    let value = if arg.is_empty() || arg.eq_ignore_ascii_case("none") {
        Value::Null
    } else {
        Value::String(arg.to_string())
    };
    intent.settings_update.insert(key.to_string(), value);
    intent
}

fn parse_batch(arg: &str, text: &str) -> Intent {
    let mut words = arg.split_whitespace().peekable();
    let Some(count) = words.next().and_then(|value| value.parse::<u64>().ok()) else {
        return Intent::invalid(text, BATCH_COMMAND.command, "usage: /batch <1-4> [multi] <prompt>");
    };
    let multi_model = words
        .peek()
        .is_some_and(|value| value.eq_ignore_ascii_case("multi"));
    if multi_model {
        words.next();
    }
    let prompt = words.collect::<Vec<&str>>().join(" ");
    if prompt.is_empty() {
        return Intent::invalid(text, BATCH_COMMAND.command, "batch needs a prompt");
    }
    let mut intent = Intent::new(BATCH_COMMAND.action, text);
    intent.prompt = Some(prompt);
    intent
        .command_args
        .insert("variations".to_string(), Value::from(count));
    intent
        .command_args
        .insert("multi_model".to_string(), Value::Bool(multi_model));
    intent
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some((spec, key)) = SETTING_COMMANDS
                .iter()
                .find(|(spec, _)| spec.command == command)
            {
                return parse_setting(&command, key, spec.action, arg, text);
            }

            if let Some(action) = find_action(&command, SINGLE_ARG_COMMANDS) {
                let value = parse_single_path_arg(arg);
                if value.is_empty() && action != "lock" {
                    return Intent::invalid(text, &command, format!("/{command} needs an argument"));
                }
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "arg".to_string(),
                    if value.is_empty() {
                        Value::Null
                    } else {
                        Value::String(value)
                    },
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if command == REVERT_COMMAND.command {
                let Ok(index) = arg.parse::<i64>() else {
                    return Intent::invalid(text, &command, "usage: /revert <turn index>");
                };
                let mut intent = Intent::new(REVERT_COMMAND.action, text);
                intent
                    .command_args
                    .insert("index".to_string(), Value::from(index));
                return intent;
            }

            if command == BRANCH_COMMAND.command {
                let parts = parse_path_args(arg);
                let Some(index) = parts.first().and_then(|value| value.parse::<i64>().ok()) else {
                    return Intent::invalid(text, &command, "usage: /branch <turn index> [name]");
                };
                let name = parts[1..].join(" ");
                let mut intent = Intent::new(BRANCH_COMMAND.action, text);
                intent
                    .command_args
                    .insert("index".to_string(), Value::from(index));
                intent.command_args.insert(
                    "name".to_string(),
                    if name.is_empty() {
                        Value::Null
                    } else {
                        Value::String(name)
                    },
                );
                return intent;
            }

            if command == BATCH_COMMAND.command {
                return parse_batch(arg, text);
            }

            if command == COMPOSE_COMMAND.command {
                let mut parts = parse_path_args(arg);
                if parts.len() < 3 {
                    return Intent::invalid(
                        text,
                        &command,
                        "usage: /compose <image> <image> [more images] <prompt>",
                    );
                }
                let prompt = parts.pop().unwrap_or_default();
                let mut intent = Intent::new(COMPOSE_COMMAND.action, text);
                intent.prompt = Some(prompt);
                intent
                    .command_args
                    .insert("paths".to_string(), string_list(parts));
                return intent;
            }

            if command == MASK_COMMAND.command {
                let parts = parse_path_args(arg);
                if parts.len() < 3 {
                    return Intent::invalid(text, &command, "usage: /mask <image> <mask.png> <prompt>");
                }
                let mut intent = Intent::new(MASK_COMMAND.action, text);
                intent.prompt = Some(parts[2..].join(" "));
                intent
                    .command_args
                    .insert("image".to_string(), Value::String(parts[0].clone()));
                intent
                    .command_args
                    .insert("mask".to_string(), Value::String(parts[1].clone()));
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("send_turn", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
