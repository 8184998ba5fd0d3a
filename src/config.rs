//! Behaviour switches and I/O handles for one shim process.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

pub type ExitFn = Box<dyn FnOnce(i32) + Send>;

/// Built once from [`BinaryOpt`]s; read-only afterwards.
pub struct Config {
    /// Do not mark the process as a child subreaper.
    pub no_subreaper: bool,
    /// Do not start the reaper task.
    pub no_reaper: bool,
    /// Leave logging to the caller.
    pub no_setup_logger: bool,
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub exit_func: ExitFn,
    /// Arguments without the program name.
    pub args: Vec<String>,
}

/// One functional override applied to a [`Config`].
pub type BinaryOpt = Box<dyn FnOnce(&mut Config)>;

impl Default for Config {
    fn default() -> Self {
        Self {
            no_subreaper: false,
            no_reaper: false,
            no_setup_logger: false,
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            exit_func: Box::new(shim_exit),
            args: std::env::args().skip(1).collect(),
        }
    }
}

impl Config {
    /// Applies `opts` in order over the defaults.
    pub fn from_opts(opts: impl IntoIterator<Item = BinaryOpt>) -> Self {
        let mut config = Self::default();
        for opt in opts {
            opt(&mut config);
        }
        config
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("no_subreaper", &self.no_subreaper)
            .field("no_reaper", &self.no_reaper)
            .field("no_setup_logger", &self.no_setup_logger)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

pub fn with_exit_func<F>(f: F) -> BinaryOpt
where
    F: FnOnce(i32) + Send + 'static,
{
    Box::new(move |c: &mut Config| c.exit_func = Box::new(f))
}

pub fn with_args<I, S>(args: I) -> BinaryOpt
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    Box::new(move |c: &mut Config| c.args = args)
}

pub fn with_stdio<R, W>(stdin: R, stdout: W) -> BinaryOpt
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    Box::new(move |c: &mut Config| {
        c.stdin = Box::new(stdin);
        c.stdout = Box::new(stdout);
    })
}

pub fn with_no_subreaper() -> BinaryOpt {
    Box::new(|c: &mut Config| c.no_subreaper = true)
}

pub fn with_no_reaper() -> BinaryOpt {
    Box::new(|c: &mut Config| c.no_reaper = true)
}

pub fn with_no_setup_logger() -> BinaryOpt {
    Box::new(|c: &mut Config| c.no_setup_logger = true)
}

/// Default exit callback: reports the code on stderr and exits.
pub fn shim_exit(code: i32) {
    eprintln!("SHIM_EXIT: pid={} code={}", std::process::id(), code);
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_opts_apply_in_order() {
        let config = Config::from_opts([
            with_args(["-namespace", "a"]),
            with_no_reaper(),
            with_args(["-namespace", "b"]),
        ]);
        assert_eq!(config.args, vec!["-namespace", "b"]);
        assert!(config.no_reaper);
        assert!(!config.no_subreaper);
        assert!(!config.no_setup_logger);
    }

    #[test]
    fn test_exit_func_override() {
        let code = Arc::new(AtomicI32::new(-1));
        let seen = Arc::clone(&code);
        let config = Config::from_opts([with_exit_func(move |c| seen.store(c, Ordering::SeqCst))]);
        (config.exit_func)(1);
        assert_eq!(code.load(Ordering::SeqCst), 1);
    }
}
