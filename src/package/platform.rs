//! Host platform detection and asset filename templates
//!
//! Templates use `{os}`, `{arch}`, `{target}` and `{version}` placeholders.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),

    #[error("unterminated placeholder")]
    Unterminated,

    #[error("no release target for {}/{}", .0.os, .0.arch)]
    UnsupportedPlatform(Platform),
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    /// Operating system name as used in release asset names.
    pub fn os_name(&self) -> Result<&'static str, TemplateError> {
        match self.os {
            "linux" => Ok("linux"),
            "macos" => Ok("darwin"),
            "windows" => Ok("windows"),
            _ => Err(TemplateError::UnsupportedPlatform(*self)),
        }
    }

    pub fn arch_name(&self) -> Result<&'static str, TemplateError> {
        match self.arch {
            "x86_64" => Ok("x64"),
            "aarch64" => Ok("arm64"),
            "x86" => Ok("x86"),
            _ => Err(TemplateError::UnsupportedPlatform(*self)),
        }
    }

    pub fn target_triple(&self) -> Result<&'static str, TemplateError> {
        match (self.os, self.arch) {
            ("linux", "x86_64") => Ok("x86_64-unknown-linux-gnu"),
            ("linux", "aarch64") => Ok("aarch64-unknown-linux-gnu"),
            ("macos", "x86_64") => Ok("x86_64-apple-darwin"),
            ("macos", "aarch64") => Ok("aarch64-apple-darwin"),
            ("windows", "x86_64") => Ok("x86_64-pc-windows-msvc"),
            ("windows", "aarch64") => Ok("aarch64-pc-windows-msvc"),
            _ => Err(TemplateError::UnsupportedPlatform(*self)),
        }
    }

    /// Expand a template against this platform and a package version.
    pub fn expand(&self, template: &str, version: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after.find('}').ok_or(TemplateError::Unterminated)?;
            let value = match &after[..end] {
                "os" => self.os_name()?,
                "arch" => self.arch_name()?,
                "target" => self.target_triple()?,
                "version" => version,
                other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
            };
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_X64: Platform = Platform {
        os: "linux",
        arch: "x86_64",
    };

    #[test]
    fn test_expand_all_placeholders() {
        let name = LINUX_X64
            .expand("server-{version}-{os}-{arch}.tar.gz", "1.2.0")
            .unwrap();
        assert_eq!(name, "server-1.2.0-linux-x64.tar.gz");

        let triple = LINUX_X64.expand("rust-analyzer-{target}.gz", "latest").unwrap();
        assert_eq!(triple, "rust-analyzer-x86_64-unknown-linux-gnu.gz");
    }

    #[test]
    fn test_expand_without_placeholders() {
        assert_eq!(LINUX_X64.expand("plain.zip", "1").unwrap(), "plain.zip");
    }

    #[test]
    fn test_expand_failures() {
        assert_eq!(
            LINUX_X64.expand("x-{flavor}", "1"),
            Err(TemplateError::UnknownPlaceholder("flavor".to_string()))
        );
        assert_eq!(LINUX_X64.expand("x-{os", "1"), Err(TemplateError::Unterminated));

        let odd = Platform {
            os: "freebsd",
            arch: "x86_64",
        };
        assert!(matches!(
            odd.expand("{target}", "1"),
            Err(TemplateError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_error_messages() {
        let unknown = LINUX_X64.expand("x-{flavor}", "1").unwrap_err();
        assert_eq!(unknown.to_string(), "unknown placeholder {flavor}");

        let odd = Platform {
            os: "freebsd",
            arch: "riscv64",
        };
        let err: Box<dyn std::error::Error> = Box::new(odd.os_name().unwrap_err());
        assert_eq!(err.to_string(), "no release target for freebsd/riscv64");
    }
}
