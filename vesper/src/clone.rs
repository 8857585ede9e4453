use std::collections::HashMap;

use crate::{Label, TempCounts, Variable};

/// Renaming context used when an instruction stream is cloned, typically to
/// inline a callee into a caller.
///
/// Explicit renames always win. In inlining mode, temporaries and labels
/// without an explicit rename are moved to fresh slots of the host body so
/// they cannot collide with the host's own.
#[derive(Debug, Default)]
pub struct CloneInfo {
    variables: HashMap<Variable, Variable>,
    labels: HashMap<Label, Label>,
    host: Option<Host>,
}

#[derive(Debug)]
struct Host {
    temps: TempCounts,
    next_label: u32,
}

impl CloneInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renames(renames: impl IntoIterator<Item = (Variable, Variable)>) -> Self {
        Self {
            variables: renames.into_iter().collect(),
            ..Self::default()
        }
    }

    /// `temps` and `next_label` describe what the host body already uses.
    pub fn for_inlining(temps: TempCounts, next_label: u32) -> Self {
        Self {
            host: Some(Host { temps, next_label }),
            ..Self::default()
        }
    }

    pub fn rename(&mut self, from: Variable, to: Variable) {
        self.variables.insert(from, to);
    }

    pub fn renamed_variable(&mut self, var: &Variable) -> Variable {
        if let Some(renamed) = self.variables.get(var) {
            return renamed.clone();
        }
        match (&mut self.host, var) {
            (Some(host), Variable::Temp { kind, .. }) => {
                let fresh = Variable::typed_temp(*kind, host.temps.allocate(*kind));
                self.variables.insert(var.clone(), fresh.clone());
                fresh
            }
            _ => var.clone(),
        }
    }

    pub fn renamed_label(&mut self, label: Label) -> Label {
        if let Some(renamed) = self.labels.get(&label) {
            return *renamed;
        }
        match &mut self.host {
            Some(host) => {
                let fresh = Label(host.next_label);
                host.next_label += 1;
                self.labels.insert(label, fresh);
                fresh
            }
            None => label,
        }
    }

    /// Temp counts the host needs after cloning, if inlining.
    pub fn host_temps(&self) -> Option<TempCounts> {
        self.host.as_ref().map(|host| host.temps)
    }
}
