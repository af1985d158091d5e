use std::str::FromStr;
use strum::EnumString;

/// Every request command the protocol defines, as it appears in the `command` field of a
/// request.
///
/// Names the adapter has never heard of end up in [`Command::Unknown`], so parsing never fails.
#[derive(Clone, Debug, Eq, PartialEq, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum Command {
    Attach,
    BreakpointLocations,
    Cancel,
    Completions,
    ConfigurationDone,
    Continue,
    DataBreakpointInfo,
    Disassemble,
    Disconnect,
    Evaluate,
    ExceptionInfo,
    Goto,
    GotoTargets,
    Initialize,
    Launch,
    LoadedSources,
    Modules,
    Next,
    Pause,
    ReadMemory,
    Restart,
    RestartFrame,
    ReverseContinue,
    Scopes,
    SetBreakpoints,
    SetDataBreakpoints,
    SetExceptionBreakpoints,
    SetExpression,
    SetFunctionBreakpoints,
    SetInstructionBreakpoints,
    SetVariable,
    Source,
    StackTrace,
    StepBack,
    StepIn,
    StepInTargets,
    StepOut,
    Terminate,
    TerminateThreads,
    Threads,
    Variables,
    WriteMemory,

    /// A command name that isn't part of the protocol at all
    #[strum(default)]
    Unknown(String),
}

impl Command {
    pub fn parse(name: &str) -> Self {
        // Parsing is total: `#[strum(default)]` turns any unmatched name into `Unknown`, so the
        // error arm never runs.  strum still types it as fallible.
        Self::from_str(name).unwrap_or_else(|_| Self::Unknown(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_protocol_command_names() {
        assert_eq!(Command::parse("initialize"), Command::Initialize);
        assert_eq!(Command::parse("launch"), Command::Launch);
        assert_eq!(Command::parse("disconnect"), Command::Disconnect);
        assert_eq!(Command::parse("configurationDone"), Command::ConfigurationDone);
        assert_eq!(
            Command::parse("setExceptionBreakpoints"),
            Command::SetExceptionBreakpoints
        );
        assert_eq!(Command::parse("stepInTargets"), Command::StepInTargets);
        assert_eq!(Command::parse("continue"), Command::Continue);
    }

    #[test]
    fn unrecognized_names_are_kept_verbatim() {
        assert_matches!(Command::parse("frobnicate"), Command::Unknown(name) if name == "frobnicate");
        assert_matches!(Command::parse(""), Command::Unknown(name) if name.is_empty());

        // Matching is exact; the protocol's names are case sensitive
        assert_matches!(Command::parse("Initialize"), Command::Unknown(_));
    }
}
