//! `classes` and `methods`.

use super::{strings::StringTable, trees::NameTree};
use crate::{
    binary::reader::Reader,
    error::{DecodeError, Result},
};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub name: String,
    pub package: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassTable {
    classes: Vec<ClassInfo>,
}

impl ClassTable {
    pub fn parse(payload: &[u8], strings: &StringTable, packages: &NameTree) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let mut classes = vec![];
        while !reader.is_empty() {
            let at = reader.position();
            let package = match reader.uleb32()? as usize {
                0 => None,
                package => Some(packages.check(package - 1, at, "package")?),
            };
            let name = strings.read_ref(&mut reader)?;
            classes.push(ClassInfo { name, package });
        }
        Ok(Self { classes })
    }

    pub fn get(&self, index: usize) -> Option<&ClassInfo> {
        self.classes.get(index)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter()
    }

    pub(crate) fn check(&self, index: usize, at: usize) -> Result<usize> {
        if index < self.classes.len() {
            Ok(index)
        } else {
            Err(DecodeError::malformed(
                at,
                format!("class index {} out of range ({} classes)", index, self.classes.len()),
            ))
        }
    }

    /// Package-qualified class name.
    pub fn full_name(&self, index: usize, packages: &NameTree) -> Option<String> {
        let class = self.classes.get(index)?;
        match class.package.and_then(|package| packages.full_name(package)) {
            Some(package) if !package.is_empty() => Some(format!("{}.{}", package, class.name)),
            _ => Some(class.name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub class: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MethodTable {
    methods: Vec<MethodInfo>,
}

impl MethodTable {
    pub fn parse(payload: &[u8], strings: &StringTable, classes: &ClassTable) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let mut methods = vec![];
        while !reader.is_empty() {
            let at = reader.position();
            let class = classes.check(reader.uleb32()? as usize, at)?;
            let name = strings.read_ref(&mut reader)?;
            methods.push(MethodInfo { name, class });
        }
        Ok(Self { methods })
    }

    pub fn get(&self, index: usize) -> Option<&MethodInfo> {
        self.methods.get(index)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodInfo> {
        self.methods.iter()
    }

    pub(crate) fn check(&self, index: usize, at: usize) -> Result<usize> {
        if index < self.methods.len() {
            Ok(index)
        } else {
            Err(DecodeError::malformed(
                at,
                format!("method index {} out of range ({} methods)", index, self.methods.len()),
            ))
        }
    }
}

/// Renders class and method tables with fully qualified names.
pub struct QualifiedNames<'a> {
    pub packages: &'a NameTree,
    pub classes: &'a ClassTable,
    pub methods: Option<&'a MethodTable>,
}

impl QualifiedNames<'_> {
    pub fn method(&self, index: usize) -> Option<String> {
        let method = self.methods?.get(index)?;
        let class = self.classes.full_name(method.class, self.packages)?;
        Some(format!("{}.{}", class, method.name))
    }
}

impl fmt::Display for ClassTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, class) in self.classes.iter().enumerate() {
            match class.package {
                Some(package) => writeln!(f, "  #{} {} (package #{})", index, class.name, package)?,
                None => writeln!(f, "  #{} {}", index, class.name)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, method) in self.methods.iter().enumerate() {
            writeln!(f, "  #{} {} (class #{})", index, method.name, method.class)?;
        }
        Ok(())
    }
}
