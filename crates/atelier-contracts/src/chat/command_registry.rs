#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole remainder is one setting value.
pub(crate) const SETTING_COMMANDS: &[(CommandSpec, &str)] = &[
    (
        CommandSpec {
            command: "model",
            action: "set_model",
        },
        "model",
    ),
    (
        CommandSpec {
            command: "style",
            action: "set_style",
        },
        "style_preset",
    ),
    (
        CommandSpec {
            command: "aspect",
            action: "set_aspect",
        },
        "aspect_ratio",
    ),
    (
        CommandSpec {
            command: "resolution",
            action: "set_resolution",
        },
        "resolution",
    ),
    (
        CommandSpec {
            command: "negative",
            action: "set_negative",
        },
        "negative_prompt",
    ),
    (
        CommandSpec {
            command: "weight",
            action: "set_weight",
        },
        "image_weight",
    ),
];

pub(crate) const SINGLE_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "switch",
        action: "switch_branch",
    },
    CommandSpec {
        command: "lock",
        action: "lock",
    },
    CommandSpec {
        command: "use",
        action: "set_reference",
    },
    CommandSpec {
        command: "open",
        action: "open_session",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "undo",
        action: "undo",
    },
    CommandSpec {
        command: "unlock",
        action: "unlock",
    },
    CommandSpec {
        command: "usage",
        action: "usage",
    },
    CommandSpec {
        command: "branches",
        action: "list_branches",
    },
    CommandSpec {
        command: "sessions",
        action: "list_sessions",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
    },
    CommandSpec {
        command: "recommend",
        action: "recommend_model",
    },
    CommandSpec {
        command: "new",
        action: "new_session",
    },
];

pub(crate) const REVERT_COMMAND: CommandSpec = CommandSpec {
    command: "revert",
    action: "revert",
};

pub(crate) const BRANCH_COMMAND: CommandSpec = CommandSpec {
    command: "branch",
    action: "branch",
};

pub(crate) const BATCH_COMMAND: CommandSpec = CommandSpec {
    command: "batch",
    action: "batch",
};

pub(crate) const COMPOSE_COMMAND: CommandSpec = CommandSpec {
    command: "compose",
    action: "compose",
};

pub(crate) const MASK_COMMAND: CommandSpec = CommandSpec {
    command: "mask",
    action: "mask_edit",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/model <id>",
    "/models",
    "/recommend",
    "/style <preset>",
    "/aspect <ratio>",
    "/resolution <1K|2K|4K>",
    "/negative <text>",
    "/weight <0-100>",
    "/use <image>",
    "/undo",
    "/revert <turn index, -1 clears>",
    "/branch <turn index> [name]",
    "/branches",
    "/switch <branch id or name>",
    "/lock [image id]",
    "/unlock",
    "/usage",
    "/batch <1-4> [multi] <prompt>",
    "/compose <image> <image> [more images] <prompt>",
    "/mask <image> <mask.png> <prompt>",
    "/sessions",
    "/open <session id>",
    "/new",
    "/help",
];
