use std::process::Command;

/// Build the `/bin/sh -c` invocation for a command line
pub fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(command_line);
    command
}

/// Wrap a command line so the real pid and exit code are written to fd 3
///
/// The command runs in the background with the wrapper's stdin, the wrapper
/// reports `$!`, waits for it and reports its status before exiting with it.
pub fn sigchild_wrapper(command_line: &str) -> String {
    format!(
        "{{ ({command_line}) <&3 3<&- 3>/dev/null & }} 3<&0;\
         pid=$!; echo $pid >&3; wait $pid; code=$?; echo $code >&3; exit $code"
    )
}
