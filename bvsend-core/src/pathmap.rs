//! Path translation between this process and the muxer's filesystem namespace.
//!
//! The muxer may run under WSL or on the host of a container we live in, so
//! the paths we hand it are rewritten with a fixed string convention picked by
//! the configured profile. Nothing here touches the filesystem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const DEFAULT_WSL_MOUNT_ROOT: &str = "/mnt";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum EnvironmentProfile {
    /// Muxer shares our namespace.
    #[default]
    Native,
    /// We run on Windows, the muxer inside WSL (`C:\x` is `/mnt/c/x`).
    Wsl {
        #[serde(default = "default_mount_root")]
        mount_root: String,
    },
    /// We run inside a container whose `local_prefix` is mounted at
    /// `foreign_prefix` where the muxer runs.
    Container {
        local_prefix: PathBuf,
        foreign_prefix: PathBuf,
    },
}

fn default_mount_root() -> String {
    DEFAULT_WSL_MOUNT_ROOT.to_string()
}

impl EnvironmentProfile {
    pub fn name(&self) -> &'static str {
        match self {
            EnvironmentProfile::Native => "native",
            EnvironmentProfile::Wsl { .. } => "wsl",
            EnvironmentProfile::Container { .. } => "container",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathTranslator {
    profile: EnvironmentProfile,
}

impl PathTranslator {
    pub fn new(profile: EnvironmentProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &EnvironmentProfile {
        &self.profile
    }

    pub fn to_foreign(&self, path: &Path) -> PathBuf {
        match &self.profile {
            EnvironmentProfile::Native => path.to_path_buf(),
            EnvironmentProfile::Wsl { mount_root } => windows_to_wsl(path, mount_root),
            EnvironmentProfile::Container {
                local_prefix,
                foreign_prefix,
            } => swap_prefix(path, local_prefix, foreign_prefix),
        }
    }

    pub fn to_native(&self, path: &Path) -> PathBuf {
        match &self.profile {
            EnvironmentProfile::Native => path.to_path_buf(),
            EnvironmentProfile::Wsl { mount_root } => wsl_to_windows(path, mount_root),
            EnvironmentProfile::Container {
                local_prefix,
                foreign_prefix,
            } => swap_prefix(path, foreign_prefix, local_prefix),
        }
    }

    /// Rewrites a local path into the exact form `to_native` produces, so
    /// anything built underneath it survives a round trip.
    pub fn native_form(&self, path: &Path) -> PathBuf {
        match &self.profile {
            EnvironmentProfile::Wsl { mount_root } => {
                let foreign = windows_to_wsl(path, mount_root);
                if foreign.as_path() == path {
                    path.to_path_buf()
                } else {
                    wsl_to_windows(&foreign, mount_root)
                }
            }
            _ => path.to_path_buf(),
        }
    }
}

fn windows_to_wsl(path: &Path, mount_root: &str) -> PathBuf {
    let raw = path.to_string_lossy();
    let mut chars = raw.chars();
    let (Some(drive), Some(':')) = (chars.next(), chars.next()) else {
        return path.to_path_buf();
    };
    if !drive.is_ascii_alphabetic() {
        return path.to_path_buf();
    }
    let rest = chars
        .as_str()
        .trim_start_matches(['\\', '/'])
        .replace('\\', "/");
    let root = mount_root.trim_end_matches('/');
    let drive = drive.to_ascii_lowercase();
    if rest.is_empty() {
        PathBuf::from(format!("{root}/{drive}"))
    } else {
        PathBuf::from(format!("{root}/{drive}/{rest}"))
    }
}

fn wsl_to_windows(path: &Path, mount_root: &str) -> PathBuf {
    let raw = path.to_string_lossy();
    let root = mount_root.trim_end_matches('/');
    let Some(after_root) = raw.strip_prefix(root).and_then(|s| s.strip_prefix('/')) else {
        return path.to_path_buf();
    };
    let (drive, rest) = match after_root.split_once('/') {
        Some((drive, rest)) => (drive, rest),
        None => (after_root, ""),
    };
    let mut drive_chars = drive.chars();
    let (Some(letter), None) = (drive_chars.next(), drive_chars.next()) else {
        return path.to_path_buf();
    };
    if !letter.is_ascii_alphabetic() {
        return path.to_path_buf();
    }
    PathBuf::from(format!(
        "{}:\\{}",
        letter.to_ascii_uppercase(),
        rest.replace('/', "\\")
    ))
}

fn swap_prefix(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
        Ok(rest) => to.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wsl() -> PathTranslator {
        PathTranslator::new(EnvironmentProfile::Wsl {
            mount_root: "/mnt".to_string(),
        })
    }

    fn container() -> PathTranslator {
        PathTranslator::new(EnvironmentProfile::Container {
            local_prefix: PathBuf::from("/MaiMBot/data/tmp"),
            foreign_prefix: PathBuf::from("/srv/maibot/data/tmp"),
        })
    }

    #[test]
    fn native_is_identity() {
        let translator = PathTranslator::new(EnvironmentProfile::Native);
        let path = Path::new("/tmp/bvsend-abc/video.m4s");
        assert_eq!(translator.to_foreign(path), path);
        assert_eq!(translator.to_native(path), path);
    }

    #[test]
    fn wsl_rewrites_drive_letter() {
        let translator = wsl();
        let path = Path::new(r"E:\path\to\file.mp4");
        assert_eq!(
            translator.to_foreign(path),
            PathBuf::from("/mnt/e/path/to/file.mp4")
        );
        assert_eq!(
            translator.to_native(Path::new("/mnt/e/path/to/file.mp4")),
            PathBuf::from(r"E:\path\to\file.mp4")
        );
    }

    #[test]
    fn wsl_leaves_posix_paths_alone() {
        let translator = wsl();
        let path = Path::new("/home/user/video.mp4");
        assert_eq!(translator.to_foreign(path), path);
        assert_eq!(translator.to_native(path), path);
        assert_eq!(
            translator.to_native(Path::new("/mnt/data/file")),
            PathBuf::from("/mnt/data/file")
        );
    }

    #[test]
    fn wsl_honours_custom_mount_root() {
        let translator = PathTranslator::new(EnvironmentProfile::Wsl {
            mount_root: "/win/".to_string(),
        });
        assert_eq!(
            translator.to_foreign(Path::new(r"C:\Temp\out.mp4")),
            PathBuf::from("/win/c/Temp/out.mp4")
        );
    }

    #[test]
    fn container_swaps_shared_prefix() {
        let translator = container();
        assert_eq!(
            translator.to_foreign(Path::new("/MaiMBot/data/tmp/bvsend-1/video.m4s")),
            PathBuf::from("/srv/maibot/data/tmp/bvsend-1/video.m4s")
        );
        assert_eq!(
            translator.to_foreign(Path::new("/MaiMBot/data/tmp")),
            PathBuf::from("/srv/maibot/data/tmp")
        );
        assert_eq!(
            translator.to_foreign(Path::new("/etc/hosts")),
            PathBuf::from("/etc/hosts")
        );
    }

    #[test]
    fn wsl_native_form_canonicalises_drive_paths() {
        let translator = wsl();
        for raw in [r"d:\cache", "D:/cache", r"D:\cache"] {
            assert_eq!(
                translator.native_form(Path::new(raw)),
                PathBuf::from(r"D:\cache")
            );
        }
        assert_eq!(
            translator.native_form(Path::new("/home/bot/tmp")),
            PathBuf::from("/home/bot/tmp")
        );
        assert_eq!(
            container().native_form(Path::new("/MaiMBot/data/tmp")),
            PathBuf::from("/MaiMBot/data/tmp")
        );
    }

    #[test]
    fn generated_temp_paths_round_trip_for_every_profile() {
        let cases: Vec<(PathTranslator, Vec<&str>)> = vec![
            (
                PathTranslator::new(EnvironmentProfile::Native),
                vec!["/tmp/bvsend-x1/video.m4s", "/tmp/bvsend-x1/output.mp4"],
            ),
            (
                wsl(),
                vec![
                    r"C:\Users\bot\AppData\Local\Temp\bvsend-x1\video.m4s",
                    r"C:\Users\bot\AppData\Local\Temp\bvsend-x1\audio.m4s",
                    r"D:\cache\bvsend-x2\output.mp4",
                    r"C:\",
                ],
            ),
            (
                container(),
                vec![
                    "/MaiMBot/data/tmp/bvsend-x1/video.m4s",
                    "/MaiMBot/data/tmp/bvsend-x1/output.mp4",
                ],
            ),
        ];
        let windows = wsl();
        let configured_roots = [r"d:\cache", "D:/cache", r"c:\Users\bot\Temp"];
        let generated: Vec<String> = configured_roots
            .iter()
            .map(|root| {
                format!(
                    r"{}\bvsend-x3\video.m4s",
                    windows.native_form(Path::new(root)).display()
                )
            })
            .collect();
        let cases: Vec<(PathTranslator, Vec<&str>)> = cases
            .into_iter()
            .chain(std::iter::once((
                windows,
                generated.iter().map(String::as_str).collect(),
            )))
            .collect();
        for (translator, paths) in cases {
            for raw in paths {
                let path = Path::new(raw);
                let foreign = translator.to_foreign(path);
                assert_eq!(
                    translator.to_native(&foreign),
                    path,
                    "profile {} failed to round-trip {raw}",
                    translator.profile().name()
                );
            }
        }
    }
}
