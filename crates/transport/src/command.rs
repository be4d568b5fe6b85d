//! Command line construction for the agent CLI.
//!
//! ```text
//! <binary> --print --output-format FMT [--model M] [--append-system-prompt P]
//!          [--allowed-tools T1,T2] [--disallowed-tools ...]
//!          [--permission-mode MODE | --dangerously-skip-permissions]
//!          [--max-turns N] [--resume ID] [--verbose] -- <prompt>
//! ```

use crate::options::{CliOptions, OutputFormat, PermissionMode};

/// Full argument vector, binary first. Pure and deterministic.
///
/// The prompt is always the last argument, after `--`, so a prompt starting
/// with `-` is never read as a flag.
pub fn build_command(binary: &str, prompt: &str, options: &CliOptions) -> Vec<String> {
    let mut args = vec![binary.to_string()];
    args.extend(build_args(prompt, options));
    args
}

/// Arguments without the binary.
pub fn build_args(prompt: &str, options: &CliOptions) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        options.output_format.as_str().to_string(),
    ];

    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(prompt) = &options.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if !options.allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(options.allowed_tools.join(","));
    }
    if !options.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(options.disallowed_tools.join(","));
    }
    match options.permission_mode {
        PermissionMode::Default => {}
        PermissionMode::DangerouslySkipPermissions => {
            args.push("--dangerously-skip-permissions".to_string());
        }
        mode => {
            args.push("--permission-mode".to_string());
            args.push(mode.as_str().to_string());
        }
    }
    if let Some(turns) = options.max_turns {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }
    if let Some(session) = &options.resume {
        args.push("--resume".to_string());
        args.push(session.clone());
    }
    // stream-json output requires verbose mode
    if options.output_format == OutputFormat::StreamJson {
        args.push("--verbose".to_string());
    }

    args.push("--".to_string());
    args.push(prompt.to_string());
    args
}
