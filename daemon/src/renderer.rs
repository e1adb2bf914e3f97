/// Platform renderers: the narrow contract through which images are
/// actually installed on a surface.
///
/// The daemon core never branches on platform; [`platform_renderer`] picks
/// the implementation once at process start and everything downstream works
/// against the [`Renderer`] trait. Implementations never inspect pixels —
/// they receive a local file path and report success or failure.
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::config::{FitMode, SubscriptionKind};

pub trait Renderer: Send + Sync {
    /// Installs the image at `image` on the surface `kind`, mapped per
    /// `fit`.
    fn set_wallpaper(&self, image: &Path, fit: FitMode, kind: SubscriptionKind) -> Result<()>;
}

/// Selects the renderer for the current platform.
pub fn platform_renderer() -> Arc<dyn Renderer> {
    #[cfg(windows)]
    {
        Arc::new(windows_impl::WindowsRenderer)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos_impl::MacRenderer)
    }
    #[cfg(not(any(windows, target_os = "macos")))]
    {
        Arc::new(gnome_impl::GnomeRenderer)
    }
}

/// Windows user-registry values for each fit mode:
/// (`WallpaperStyle`, `TileWallpaper`) under `HKCU\Control Panel\Desktop`.
fn wallpaper_style_values(fit: FitMode) -> (&'static str, &'static str) {
    match fit {
        FitMode::Center => ("0", "0"),
        FitMode::Tile => ("0", "1"),
        FitMode::Stretch => ("2", "0"),
        FitMode::Fit => ("6", "0"),
        FitMode::Fill => ("10", "0"),
    }
}

/// GNOME `picture-options` value for each fit mode.
fn gnome_picture_option(fit: FitMode) -> &'static str {
    match fit {
        FitMode::Center => "centered",
        FitMode::Tile => "wallpaper",
        FitMode::Stretch => "stretched",
        FitMode::Fit => "scaled",
        FitMode::Fill => "zoom",
    }
}

// ── Windows ────────────────────────────────────────────────────────────────────

#[cfg(windows)]
mod windows_impl {
    use super::{wallpaper_style_values, Renderer};
    use crate::config::{FitMode, SubscriptionKind};
    use anyhow::{bail, Context, Result};
    use std::path::Path;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegSetValueExW, HKEY, HKEY_CURRENT_USER,
        HKEY_LOCAL_MACHINE, KEY_SET_VALUE, REG_DWORD, REG_OPTION_NON_VOLATILE, REG_SZ,
        REG_VALUE_TYPE,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        SystemParametersInfoW, SPIF_SENDCHANGE, SPIF_UPDATEINIFILE, SPI_SETDESKWALLPAPER,
    };

    const DESKTOP_KEY: &str = r"Control Panel\Desktop";
    /// MDM personalization keys; also honored on non-managed machines.
    /// Writing here requires elevation — the failure surfaces as an apply
    /// error for the lock-screen item only.
    const LOCKSCREEN_KEY: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\PersonalizationCSP";

    /// Converts a Rust `&str` to a null-terminated UTF-16 `Vec<u16>`.
    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn set_registry_value(
        root: HKEY,
        key: &str,
        name: &str,
        value_type: REG_VALUE_TYPE,
        data: &[u8],
    ) -> Result<()> {
        let key_w = to_wide(key);
        let name_w = to_wide(name);

        let mut hkey = HKEY::default();
        let err = unsafe {
            RegCreateKeyExW(
                root,
                PCWSTR::from_raw(key_w.as_ptr()),
                0,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_SET_VALUE,
                None,
                &mut hkey,
                None,
            )
        };
        if err != ERROR_SUCCESS {
            bail!("RegCreateKeyExW failed for {key}: {:?}", err);
        }

        let err = unsafe {
            RegSetValueExW(hkey, PCWSTR::from_raw(name_w.as_ptr()), 0, value_type, Some(data))
        };
        unsafe {
            let _ = RegCloseKey(hkey);
        };

        if err != ERROR_SUCCESS {
            bail!("RegSetValueExW failed for {key}\\{name}: {:?}", err);
        }
        Ok(())
    }

    fn set_string_value(root: HKEY, key: &str, name: &str, value: &str) -> Result<()> {
        let data_w = to_wide(value);
        let data: &[u8] = unsafe {
            std::slice::from_raw_parts(data_w.as_ptr() as *const u8, data_w.len() * 2)
        };
        set_registry_value(root, key, name, REG_SZ, data)
    }

    fn set_dword_value(root: HKEY, key: &str, name: &str, value: u32) -> Result<()> {
        set_registry_value(root, key, name, REG_DWORD, &value.to_le_bytes())
    }

    pub struct WindowsRenderer;

    impl Renderer for WindowsRenderer {
        fn set_wallpaper(&self, image: &Path, fit: FitMode, kind: SubscriptionKind) -> Result<()> {
            // No canonicalize: the \\?\ prefix it introduces is rejected by
            // SystemParametersInfoW on some systems.
            if !image.is_file() {
                bail!("Image file not accessible: {}", image.display());
            }
            let path_str = image.to_string_lossy();

            match kind {
                SubscriptionKind::Desktop => {
                    let (style, tile) = wallpaper_style_values(fit);
                    set_string_value(HKEY_CURRENT_USER, DESKTOP_KEY, "WallpaperStyle", style)?;
                    set_string_value(HKEY_CURRENT_USER, DESKTOP_KEY, "TileWallpaper", tile)?;

                    let path_w = to_wide(&path_str);
                    unsafe {
                        SystemParametersInfoW(
                            SPI_SETDESKWALLPAPER,
                            0,
                            Some(path_w.as_ptr() as *mut _),
                            SPIF_UPDATEINIFILE | SPIF_SENDCHANGE,
                        )
                    }
                    .context("SystemParametersInfoW(SPI_SETDESKWALLPAPER) failed")?;
                    Ok(())
                }
                SubscriptionKind::Lockscreen => {
                    set_string_value(
                        HKEY_LOCAL_MACHINE,
                        LOCKSCREEN_KEY,
                        "LockScreenImagePath",
                        &path_str,
                    )?;
                    set_string_value(
                        HKEY_LOCAL_MACHINE,
                        LOCKSCREEN_KEY,
                        "LockScreenImageUrl",
                        &path_str,
                    )?;
                    set_dword_value(HKEY_LOCAL_MACHINE, LOCKSCREEN_KEY, "LockScreenImageStatus", 1)
                }
            }
        }
    }
}

// ── macOS ──────────────────────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
mod macos_impl {
    use super::Renderer;
    use crate::config::{FitMode, SubscriptionKind};
    use anyhow::{bail, Context, Result};
    use std::path::Path;
    use std::process::Command;

    pub struct MacRenderer;

    impl Renderer for MacRenderer {
        fn set_wallpaper(&self, image: &Path, _fit: FitMode, kind: SubscriptionKind) -> Result<()> {
            if kind == SubscriptionKind::Lockscreen {
                bail!("lock-screen images are not supported on macOS");
            }

            let script = format!(
                r#"tell application "System Events" to set picture of every desktop to "{}""#,
                image.display()
            );
            let output = Command::new("osascript")
                .args(["-e", &script])
                .output()
                .context("Failed to run osascript")?;
            if !output.status.success() {
                bail!("osascript failed: {}", String::from_utf8_lossy(&output.stderr).trim());
            }
            Ok(())
        }
    }
}

// ── GNOME (Linux and other unix desktops) ──────────────────────────────────────

#[cfg(not(any(windows, target_os = "macos")))]
mod gnome_impl {
    use super::{gnome_picture_option, Renderer};
    use crate::config::{FitMode, SubscriptionKind};
    use anyhow::{bail, Context, Result};
    use std::path::Path;
    use std::process::Command;

    pub struct GnomeRenderer;

    fn gsettings_set(schema: &str, key: &str, value: &str) -> Result<()> {
        let output = Command::new("gsettings")
            .args(["set", schema, key, value])
            .output()
            .context("Failed to run gsettings")?;
        if !output.status.success() {
            bail!(
                "gsettings set {schema} {key} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    impl Renderer for GnomeRenderer {
        fn set_wallpaper(&self, image: &Path, fit: FitMode, kind: SubscriptionKind) -> Result<()> {
            let uri = format!("file://{}", image.display());
            let option = gnome_picture_option(fit);
            match kind {
                SubscriptionKind::Desktop => {
                    gsettings_set("org.gnome.desktop.background", "picture-uri", &uri)?;
                    gsettings_set("org.gnome.desktop.background", "picture-uri-dark", &uri)?;
                    gsettings_set("org.gnome.desktop.background", "picture-options", option)
                }
                SubscriptionKind::Lockscreen => {
                    gsettings_set("org.gnome.desktop.screensaver", "picture-uri", &uri)?;
                    gsettings_set("org.gnome.desktop.screensaver", "picture-options", option)
                }
            }
        }
    }
}
