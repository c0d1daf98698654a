use indexmap::IndexMap;
use thiserror::Error;

/// The sections of a wheel's `entry_points.txt` we care about.
const CONSOLE_SCRIPTS: &str = "console_scripts";
const GUI_SCRIPTS: &str = "gui_scripts";

/// Script entry points declared by a wheel, split by section.
///
/// Each entry is rendered as `"name = module:function"`, which is the form
/// conda's `link.json` expects verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPoints {
    /// Entries from the `console_scripts` section.
    pub console_scripts: Vec<String>,
    /// Entries from the `gui_scripts` section.
    pub gui_scripts: Vec<String>,
}

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ParseEntryPointsError {
    #[error("entry_points.txt is not valid UTF-8")]
    NotUtf8,

    #[error("entry outside of any section: '{0}'")]
    EntryOutsideSection(String),
}

impl EntryPoints {
    /// Parses the grouped key/value format of `entry_points.txt`. Sections
    /// other than `console_scripts` and `gui_scripts` are ignored.
    pub fn parse(content: &[u8]) -> Result<Self, ParseEntryPointsError> {
        let content = std::str::from_utf8(content).map_err(|_| ParseEntryPointsError::NotUtf8)?;

        let mut sections: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut current: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(section.trim().to_owned());
                continue;
            }
            let Some((name, target)) = line.split_once('=') else {
                continue;
            };
            let section = current
                .as_ref()
                .ok_or_else(|| ParseEntryPointsError::EntryOutsideSection(line.to_owned()))?;
            sections
                .entry(section.clone())
                .or_default()
                .push(format!("{} = {}", name.trim(), target.trim()));
        }

        Ok(EntryPoints {
            console_scripts: sections.shift_remove(CONSOLE_SCRIPTS).unwrap_or_default(),
            gui_scripts: sections.shift_remove(GUI_SCRIPTS).unwrap_or_default(),
        })
    }

    /// All entry points, console scripts first.
    pub fn all(&self) -> Vec<String> {
        self.console_scripts
            .iter()
            .chain(self.gui_scripts.iter())
            .cloned()
            .collect()
    }

    /// True when the wheel declares no scripts at all.
    pub fn is_empty(&self) -> bool {
        self.console_scripts.is_empty() && self.gui_scripts.is_empty()
    }
}
