use super::{
    class_layout::ClassLayoutInfo,
    classes::{ClassTable, MethodTable, QualifiedNames},
    control_flow::ControlFlowInfo,
    graph::{DebugSection, DebugSectionGraph},
    lines::LineInfo,
    strings::StringTable,
    trees::NameTree,
    variables::VariablesInfo,
};
use crate::{
    binary::{
        parser::ModuleParser,
        section::{SectionCode, SectionConsumer, SectionHeader},
        source::SliceSource,
    },
    error::Result,
};
use std::fmt;
use tracing::debug;

/// Everything decoded from a module's debug sections. A table is `None`
/// when its section was absent or one of its dependencies was.
#[derive(Debug, Default)]
pub struct DebugInfo {
    pub strings: Option<StringTable>,
    pub files: Option<NameTree>,
    pub packages: Option<NameTree>,
    pub classes: Option<ClassTable>,
    pub methods: Option<MethodTable>,
    pub lines: Option<LineInfo>,
    pub variables: Option<VariablesInfo>,
    pub class_layout: Option<ClassLayoutInfo>,
    pub control_flow: Option<ControlFlowInfo>,
}

impl DebugInfo {
    /// Whether any of the custom debug sections was decoded.
    pub fn has_debug_sections(&self) -> bool {
        self.strings.is_some()
            || self.files.is_some()
            || self.packages.is_some()
            || self.classes.is_some()
            || self.methods.is_some()
            || self.lines.is_some()
            || self.variables.is_some()
            || self.class_layout.is_some()
    }

    pub fn qualified_names(&self) -> Option<QualifiedNames<'_>> {
        Some(QualifiedNames {
            packages: self.packages.as_ref()?,
            classes: self.classes.as_ref()?,
            methods: self.methods.as_ref(),
        })
    }

    /// The inline call chain at a code address, innermost first, as
    /// `method (file:line)` lines.
    pub fn symbolize(&self, address: u32) -> Option<Vec<String>> {
        let frames = self.lines.as_ref()?.find(address)?;
        let names = self.qualified_names();
        let described = frames
            .iter()
            .rev()
            .map(|frame| {
                let method = names
                    .as_ref()
                    .and_then(|names| names.method(frame.method))
                    .unwrap_or_else(|| format!("method #{}", frame.method));
                let file = frame
                    .file
                    .and_then(|file| self.files.as_ref()?.full_name(file))
                    .unwrap_or_else(|| "?".to_string());
                format!("{} ({}:{})", method, file, frame.line)
            })
            .collect();
        Some(described)
    }
}

fn write_section(
    f: &mut fmt::Formatter<'_>,
    section: DebugSection,
    table: Option<&dyn fmt::Display>,
) -> fmt::Result {
    if let Some(table) = table {
        writeln!(f, "{}:", section)?;
        write!(f, "{}", table)?;
    }
    Ok(())
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn shown<T: fmt::Display>(table: &Option<T>) -> Option<&dyn fmt::Display> {
            table.as_ref().map(|table| table as &dyn fmt::Display)
        }
        write_section(f, DebugSection::Strings, shown(&self.strings))?;
        write_section(f, DebugSection::Files, shown(&self.files))?;
        write_section(f, DebugSection::Packages, shown(&self.packages))?;
        write_section(f, DebugSection::Classes, shown(&self.classes))?;
        write_section(f, DebugSection::Methods, shown(&self.methods))?;
        if let (Some(names), Some(methods)) = (self.qualified_names(), &self.methods) {
            for index in 0..methods.len() {
                if let Some(name) = names.method(index) {
                    writeln!(f, "  #{} = {}", index, name)?;
                }
            }
        }
        write_section(f, DebugSection::Lines, shown(&self.lines))?;
        write_section(f, DebugSection::Variables, shown(&self.variables))?;
        write_section(f, DebugSection::ClassLayout, shown(&self.class_layout))?;
        write_section(f, DebugSection::ControlFlow, shown(&self.control_flow))?;
        Ok(())
    }
}

/// A [`SectionConsumer`] that routes debug sections, and optionally the
/// code section, into a [`DebugSectionGraph`].
#[derive(Debug)]
pub struct DebugInfoReader {
    graph: DebugSectionGraph,
    control_flow: bool,
}

impl Default for DebugInfoReader {
    fn default() -> Self {
        Self {
            graph: DebugSectionGraph::new(),
            control_flow: true,
        }
    }
}

impl DebugInfoReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also reconstruct control flow from the code section.
    pub fn with_control_flow(mut self, enabled: bool) -> Self {
        self.control_flow = enabled;
        self
    }

    pub fn finish(self) -> DebugInfo {
        self.graph.finish()
    }

    fn section(&self, header: &SectionHeader) -> Option<DebugSection> {
        match (header.code(), header.name.as_deref()) {
            (Some(SectionCode::Custom), Some(name)) => DebugSection::from_custom_name(name),
            (Some(SectionCode::Code), _) if self.control_flow => Some(DebugSection::ControlFlow),
            _ => None,
        }
    }
}

impl SectionConsumer for DebugInfoReader {
    fn wants(&mut self, header: &SectionHeader) -> bool {
        self.section(header).is_some()
    }

    fn consume(&mut self, header: &SectionHeader, payload: &[u8]) -> Result<()> {
        match self.section(header) {
            Some(section) => {
                debug!(%section, offset = header.offset, "debug section");
                self.graph.feed(section, header.offset, payload)
            }
            None => Ok(()),
        }
    }
}

/// Decodes the debug information of an in-memory module.
pub fn read_debug_info(wasm: &[u8]) -> Result<DebugInfo> {
    let mut parser = ModuleParser::new(DebugInfoReader::new());
    parser.parse(&mut SliceSource::new(wasm))?;
    Ok(parser.into_consumer().finish())
}

#[cfg(test)]
mod tests {
    use super::read_debug_info;
    use crate::binary::reader::tests::encode_uleb;
    use crate::debug::{lines::tests::LineProgram, strings::tests::encode_strings};
    use crate::error::DecodeError;
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn custom(name: &str, payload: &[u8], out: &mut Vec<u8>) {
        let mut body = vec![];
        encode_uleb(name.len() as u64, &mut body);
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(payload);
        out.push(0x00);
        encode_uleb(body.len() as u64, out);
        out.extend_from_slice(&body);
    }

    /// A module with one function and debug sections stored with
    /// dependents ahead of their dependencies.
    fn module_with_debug_info() -> Result<Vec<u8>> {
        let mut wasm = wat::parse_str("(module (func (call 0)))")?;
        let lines = LineProgram::default()
            .start(0)
            .file(Some(0), Some(7))
            .ptr(2)
            .start(1)
            .file(Some(0), Some(20))
            .ptr(2)
            .end()
            .end()
            .0;
        custom("lines", &lines, &mut wasm);
        custom("methods", &[0x00, 0x03, 0x00, 0x04], &mut wasm);
        custom("classes", &[0x02, 0x02], &mut wasm);
        custom("files", &[0x00, 0x0A], &mut wasm);
        custom("packages", &[0x00, 0x00, 0x01, 0x01], &mut wasm);
        custom(
            "strings",
            &encode_strings(&["org", "teavm", "Main", "main", "helper", "Main.java"]),
            &mut wasm,
        );
        Ok(wasm)
    }

    #[test]
    fn module_without_debug_sections() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/func_add.wat")?;
        let info = read_debug_info(&wasm)?;
        assert!(!info.has_debug_sections());
        assert!(info.control_flow.is_some());
        Ok(())
    }

    #[test]
    fn debug_sections_in_reverse_dependency_order() -> Result<()> {
        let info = read_debug_info(&module_with_debug_info()?)?;
        assert!(info.has_debug_sections());
        assert_eq!(
            info.symbolize(2),
            Some(vec![
                "org.teavm.Main.helper (Main.java:20)".to_string(),
                "org.teavm.Main.main (Main.java:7)".to_string(),
            ])
        );
        assert_eq!(
            info.symbolize(0),
            Some(vec!["org.teavm.Main.main (Main.java:7)".to_string()])
        );
        assert_eq!(info.symbolize(4), None);

        let dump = info.to_string();
        assert!(dump.contains("classes:\n"));
        assert!(dump.contains("#1 = org.teavm.Main.helper"));
        assert!(dump.contains("code:\n"));
        Ok(())
    }

    #[test]
    fn errors_point_into_the_module() -> Result<()> {
        let mut wasm = wat::parse_str("(module)")?;
        custom("strings", &encode_strings(&["a"]), &mut wasm);
        custom("packages", &[], &mut wasm);
        // id, size, name length and name precede the payload
        let classes_offset = wasm.len() + 1 + 1 + 1 + "classes".len();
        custom("classes", &[0x00, 0x05], &mut wasm);
        let err = read_debug_info(&wasm).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedInput { .. }));
        assert_eq!(err.offset(), Some(classes_offset + 1));
        Ok(())
    }
}
