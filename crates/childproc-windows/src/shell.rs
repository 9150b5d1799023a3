use std::process::Command;

/// Arguments handed to `cmd` before the command line
pub const CMD_FLAGS: &str = "/V:ON /E:ON /D /C";

/// Build the `cmd` invocation for a command line
///
/// Delayed expansion and command extensions are enabled and AutoRun is
/// skipped; the line is wrapped in parentheses so redirections apply to the
/// whole group.
pub fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.raw_arg(format!("{CMD_FLAGS} \"({command_line})\""));
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW
    }

    #[cfg(not(windows))]
    {
        command
            .args(CMD_FLAGS.split(' '))
            .arg(format!("({command_line})"));
    }

    command
}
