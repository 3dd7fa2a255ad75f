// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Converting between source and binary with the external `cpp` and `dtc`.
//!
//! Intermediate files live in a [`TempDir`] that is removed when the call
//! returns, whether it succeeded or not.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use tempfile::TempDir;

use crate::annotate::annotate;
use crate::config::Config;
use crate::error::{Error, Result};

/// Preprocessor command.
pub const CPP_VAR: &str = "SDT_CPP";
/// Preprocessor flags, replacing [`DEFAULT_CPP_FLAGS`].
pub const CPP_FLAGS_VAR: &str = "SDT_CPP_FLAGS";
/// Compiler command.
pub const DTC_VAR: &str = "SDT_DTC";
/// Flags passed to every compiler run.
pub const DTC_FLAGS_VAR: &str = "SDT_DTC_FLAGS";
/// Extra flags passed when producing a blob.
pub const DTC_OUTPUT_FLAGS_VAR: &str = "SDT_DTC_OUTPUT_FLAGS";

/// Flags that make `cpp` treat device tree source as assembler input.
pub const DEFAULT_CPP_FLAGS: &[&str] = &["-nostdinc", "-undef", "-x", "assembler-with-cpp"];

/// The external tools and the flags they run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// Preprocessor command and leading arguments.
    pub cpp: Vec<String>,
    pub cpp_flags: Vec<String>,
    /// Compiler command and leading arguments.
    pub dtc: Vec<String>,
    pub dtc_flags: Vec<String>,
    pub dtc_output_flags: Vec<String>,
    /// When set, comments and labels of the input file are carried into the
    /// blob as synthetic properties.
    pub annotate: Option<Config>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            cpp: vec!["cpp".to_owned()],
            cpp_flags: DEFAULT_CPP_FLAGS.iter().map(|&flag| flag.to_owned()).collect(),
            dtc: vec!["dtc".to_owned()],
            dtc_flags: Vec::new(),
            dtc_output_flags: Vec::new(),
            annotate: None,
        }
    }
}

fn split(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_owned).collect()
}

impl Toolchain {
    /// Reads the `SDT_*` environment variables. Unset variables keep their
    /// defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Toolchain::from_env`], reading variables through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut toolchain = Self::default();
        if let Some(cpp) = lookup(CPP_VAR).filter(|value| !value.trim().is_empty()) {
            toolchain.cpp = split(&cpp);
        }
        if let Some(flags) = lookup(CPP_FLAGS_VAR) {
            toolchain.cpp_flags = split(&flags);
        }
        if let Some(dtc) = lookup(DTC_VAR).filter(|value| !value.trim().is_empty()) {
            toolchain.dtc = split(&dtc);
        }
        if let Some(flags) = lookup(DTC_FLAGS_VAR) {
            toolchain.dtc_flags = split(&flags);
        }
        if let Some(flags) = lookup(DTC_OUTPUT_FLAGS_VAR) {
            toolchain.dtc_output_flags = split(&flags);
        }
        toolchain
    }

    /// Annotates the input file before preprocessing.
    #[must_use]
    pub fn with_annotation(mut self, config: Config) -> Self {
        self.annotate = Some(config);
        self
    }

    /// Preprocesses and compiles the source file at `path` into a blob.
    ///
    /// `includes` are searched by both tools, after the directory of `path`.
    /// If `dtc` fails, it is run once more with `-f` to force output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if a tool exits unsuccessfully,
    /// [`Error::Io`] if it cannot be started or a file cannot be accessed,
    /// and the errors of [`annotate`] when annotating.
    pub fn compile(&self, path: &Path, includes: &[PathBuf]) -> Result<Vec<u8>> {
        let dir = TempDir::new()?;
        let stem = path
            .file_stem()
            .map_or_else(|| OsString::from("input"), ToOwned::to_owned);
        let mut search = Vec::with_capacity(includes.len() + 1);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            search.push(parent.to_path_buf());
        }
        search.extend(includes.iter().cloned());

        let input = match &self.annotate {
            Some(config) => {
                let source = fs::read_to_string(path)?;
                let annotated = dir.path().join(&stem).with_extension("dts");
                fs::write(&annotated, annotate(&source, config)?)?;
                annotated
            }
            None => path.to_path_buf(),
        };

        let preprocessed = dir.path().join(&stem).with_extension("pp");
        let mut args: Vec<OsString> = self.cpp_flags.iter().map(OsString::from).collect();
        for include in &search {
            let mut flag = OsString::from("-I");
            flag.push(include);
            args.push(flag);
        }
        args.extend(["-o".into(), preprocessed.clone().into(), input.into()]);
        run(&self.cpp, &args)?;

        let output = dir.path().join(&stem).with_extension("dtb");
        let mut args: Vec<OsString> = self
            .dtc_flags
            .iter()
            .chain(&self.dtc_output_flags)
            .map(OsString::from)
            .collect();
        for include in &search {
            args.extend(["-i".into(), include.clone().into()]);
        }
        args.extend([
            "-o".into(),
            output.clone().into(),
            "-I".into(),
            "dts".into(),
            "-O".into(),
            "dtb".into(),
            preprocessed.into(),
        ]);
        match run(&self.dtc, &args) {
            Ok(()) => {}
            Err(error @ Error::Tool { .. }) => {
                warn!("{error}; forcing output");
                args.push("-f".into());
                run(&self.dtc, &args)?;
            }
            Err(error) => return Err(error),
        }
        Ok(fs::read(output)?)
    }

    /// Decompiles a blob into source text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if `dtc` exits unsuccessfully, or
    /// [`Error::Io`] if it cannot be started.
    pub fn decompile(&self, blob: &[u8]) -> Result<String> {
        let dir = TempDir::new()?;
        let input = dir.path().join("input.dtb");
        let output = dir.path().join("output.dts");
        fs::write(&input, blob)?;

        let mut args: Vec<OsString> = self.dtc_flags.iter().map(OsString::from).collect();
        args.extend([
            "-o".into(),
            output.clone().into(),
            "-I".into(),
            "dtb".into(),
            "-O".into(),
            "dts".into(),
            input.into(),
        ]);
        run(&self.dtc, &args)?;
        Ok(fs::read_to_string(output)?)
    }
}

fn run(command: &[String], args: &[OsString]) -> Result<()> {
    let Some((program, leading)) = command.split_first() else {
        return Err(Error::Tool {
            tool: String::new(),
            status: "not configured".to_owned(),
            stderr: String::new(),
        });
    };
    info!(
        "running {} {}",
        command.join(" "),
        args.iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );
    let output = Command::new(program).args(leading).args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::Tool {
        tool: program.clone(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain(vars: &[(&str, &str)]) -> Toolchain {
        Toolchain::from_lookup(|name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_owned())
        })
    }

    #[test]
    fn environment() {
        assert_eq!(toolchain(&[]), Toolchain::default());
        let custom = toolchain(&[
            (CPP_VAR, "clang -E"),
            (CPP_FLAGS_VAR, ""),
            (DTC_FLAGS_VAR, "-q -@"),
            (DTC_OUTPUT_FLAGS_VAR, "-p 1024"),
        ]);
        assert_eq!(custom.cpp, ["clang", "-E"]);
        assert!(custom.cpp_flags.is_empty());
        assert_eq!(custom.dtc, ["dtc"]);
        assert_eq!(custom.dtc_flags, ["-q", "-@"]);
        assert_eq!(custom.dtc_output_flags, ["-p", "1024"]);
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool() {
        let error = toolchain(&[(DTC_VAR, "false")]).decompile(&[]).unwrap_err();
        assert!(matches!(error, Error::Tool { ref tool, .. } if tool == "false"), "{error}");
    }

    #[cfg(unix)]
    #[test]
    fn failing_preprocessor() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("board.dts");
        fs::write(&source, "/dts-v1/;\n/ { };\n").unwrap();
        let error = toolchain(&[(CPP_VAR, "false")])
            .compile(&source, &[])
            .unwrap_err();
        assert!(matches!(error, Error::Tool { ref tool, .. } if tool == "false"), "{error}");
    }

    #[test]
    fn missing_tool() {
        let error = toolchain(&[(DTC_VAR, "sdt-no-such-tool")])
            .decompile(&[])
            .unwrap_err();
        assert!(matches!(error, Error::Io(_)), "{error}");
    }
}
