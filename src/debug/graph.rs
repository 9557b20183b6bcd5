//! Dependency-ordered decoding of the debug sections.
//!
//! Sections arrive in whatever order the module stores them. Each one waits
//! until the sections it refers into are decoded; the moment its last
//! dependency completes and its bytes are present, it is decoded too.

use super::{
    class_layout::ClassLayoutInfo,
    classes::{ClassTable, MethodTable},
    control_flow::ControlFlowInfo,
    info::DebugInfo,
    lines::LineInfo,
    strings::StringTable,
    trees::NameTree,
    variables::VariablesInfo,
};
use crate::error::{DecodeError, Result};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DebugSection {
    Strings,
    Files,
    Packages,
    Classes,
    Methods,
    Lines,
    Variables,
    ClassLayout,
    /// Reconstructed from the code section rather than a custom section.
    ControlFlow,
}

const SECTION_COUNT: usize = 9;

impl DebugSection {
    pub const ALL: [DebugSection; SECTION_COUNT] = [
        DebugSection::Strings,
        DebugSection::Files,
        DebugSection::Packages,
        DebugSection::Classes,
        DebugSection::Methods,
        DebugSection::Lines,
        DebugSection::Variables,
        DebugSection::ClassLayout,
        DebugSection::ControlFlow,
    ];

    /// Name of the custom section carrying this table.
    pub fn custom_name(self) -> Option<&'static str> {
        match self {
            DebugSection::Strings => Some("strings"),
            DebugSection::Files => Some("files"),
            DebugSection::Packages => Some("packages"),
            DebugSection::Classes => Some("classes"),
            DebugSection::Methods => Some("methods"),
            DebugSection::Lines => Some("lines"),
            DebugSection::Variables => Some("variables"),
            DebugSection::ClassLayout => Some("classLayout"),
            DebugSection::ControlFlow => None,
        }
    }

    pub fn from_custom_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|section| section.custom_name() == Some(name))
    }

    pub fn dependencies(self) -> &'static [DebugSection] {
        use DebugSection::*;
        match self {
            Strings | ControlFlow => &[],
            Files | Packages | Variables => &[Strings],
            Classes => &[Strings, Packages],
            Methods => &[Strings, Classes],
            Lines => &[Files, Methods],
            ClassLayout => &[Strings, Classes],
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DebugSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.custom_name().unwrap_or("code"))
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Absolute offset of the payload and the payload itself, until decoded.
    bytes: Option<(usize, Vec<u8>)>,
    unsatisfied: usize,
    fed: bool,
    decoded: bool,
}

#[derive(Debug)]
pub struct DebugSectionGraph {
    slots: [Slot; SECTION_COUNT],
    info: DebugInfo,
}

impl Default for DebugSectionGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(info: &mut DebugInfo, section: DebugSection, payload: &[u8]) -> Result<()> {
    match section {
        DebugSection::Strings => info.strings = Some(StringTable::parse(payload)?),
        DebugSection::Files => {
            let files = info
                .strings
                .as_ref()
                .map(|strings| NameTree::parse_files(payload, strings))
                .transpose()?;
            info.files = files;
        }
        DebugSection::Packages => {
            let packages = info
                .strings
                .as_ref()
                .map(|strings| NameTree::parse_packages(payload, strings))
                .transpose()?;
            info.packages = packages;
        }
        DebugSection::Classes => {
            let classes = match (&info.strings, &info.packages) {
                (Some(strings), Some(packages)) => {
                    Some(ClassTable::parse(payload, strings, packages)?)
                }
                _ => None,
            };
            info.classes = classes;
        }
        DebugSection::Methods => {
            let methods = match (&info.strings, &info.classes) {
                (Some(strings), Some(classes)) => {
                    Some(MethodTable::parse(payload, strings, classes)?)
                }
                _ => None,
            };
            info.methods = methods;
        }
        DebugSection::Lines => {
            let lines = match (&info.files, &info.methods) {
                (Some(files), Some(methods)) => Some(LineInfo::parse(payload, files, methods)?),
                _ => None,
            };
            info.lines = lines;
        }
        DebugSection::Variables => {
            let variables = info
                .strings
                .as_ref()
                .map(|strings| VariablesInfo::parse(payload, strings))
                .transpose()?;
            info.variables = variables;
        }
        DebugSection::ClassLayout => {
            let layout = match (&info.strings, &info.classes) {
                (Some(strings), Some(classes)) => {
                    Some(ClassLayoutInfo::parse(payload, strings, classes)?)
                }
                _ => None,
            };
            info.class_layout = layout;
        }
        DebugSection::ControlFlow => info.control_flow = Some(ControlFlowInfo::parse(payload)?),
    }
    Ok(())
}

impl DebugSectionGraph {
    pub fn new() -> Self {
        let slots = DebugSection::ALL.map(|section| Slot {
            unsatisfied: section.dependencies().len(),
            ..Slot::default()
        });
        Self {
            slots,
            info: DebugInfo::default(),
        }
    }

    /// Hands over the payload of `section`, found at absolute offset `base`.
    /// Decodes it, and anything that was waiting on it, as soon as all of
    /// its dependencies are available.
    pub fn feed(&mut self, section: DebugSection, base: usize, payload: &[u8]) -> Result<()> {
        let slot = &mut self.slots[section.index()];
        if slot.fed {
            return Err(DecodeError::malformed(
                base,
                format!("duplicate {} section", section),
            ));
        }
        slot.fed = true;
        slot.bytes = Some((base, payload.to_vec()));
        if slot.unsatisfied > 0 {
            debug!(%section, waiting = slot.unsatisfied, "deferring debug section");
            return Ok(());
        }
        self.run(section)
    }

    fn run(&mut self, ready: DebugSection) -> Result<()> {
        let mut worklist = vec![ready];
        while let Some(section) = worklist.pop() {
            let Some((base, payload)) = self.slots[section.index()].bytes.take() else {
                continue;
            };
            decode(&mut self.info, section, &payload).map_err(|e| e.rebase(base))?;
            self.slots[section.index()].decoded = true;
            debug!(%section, size = payload.len(), "decoded debug section");

            for dependent in DebugSection::ALL {
                if !dependent.dependencies().contains(&section) {
                    continue;
                }
                let slot = &mut self.slots[dependent.index()];
                slot.unsatisfied = slot.unsatisfied.saturating_sub(1);
                if slot.unsatisfied == 0 && slot.bytes.is_some() {
                    worklist.push(dependent);
                }
            }
        }
        Ok(())
    }

    pub fn is_decoded(&self, section: DebugSection) -> bool {
        self.slots[section.index()].decoded
    }

    /// What has been decoded so far.
    pub fn info(&self) -> &DebugInfo {
        &self.info
    }

    /// Sections still waiting for a dependency are dropped.
    pub fn finish(self) -> DebugInfo {
        for section in DebugSection::ALL {
            let slot = &self.slots[section.index()];
            if slot.fed && !slot.decoded {
                let missing: Vec<_> = section
                    .dependencies()
                    .iter()
                    .filter(|dependency| !self.slots[dependency.index()].decoded)
                    .map(ToString::to_string)
                    .collect();
                warn!(
                    %section,
                    missing = %missing.join(", "),
                    "debug section could not be decoded"
                );
            }
        }
        self.info
    }
}
