//! Builders for modules and collaborators used across the unit tests.

use std::collections::VecDeque;

use crate::{
    deobfuscation::rpc::{DynamicClient, Value},
    metadata::{module::Module, token::Token, typesystem::TypeDef},
    Error, Result,
};

/// An empty `test.dll` module with one type `ns.name` added.
pub fn module_with_type(ns: &str, name: &str) -> (Module, Token) {
    let mut module = Module::new("test.dll");
    let ty = module.add_type(TypeDef::new(ns, name));
    (module, ty)
}

/// A [`DynamicClient`] that answers from a fixed script and records what it was sent.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    answers: VecDeque<Value>,
    /// Services loaded, in order
    pub services: Vec<String>,
    /// Assemblies loaded, in order
    pub assemblies: Vec<String>,
    /// Messages sent: id and arguments
    pub sent: Vec<(u32, Vec<Value>)>,
}

impl ScriptedClient {
    pub fn new(answers: Vec<Value>) -> Self {
        ScriptedClient {
            answers: answers.into(),
            ..ScriptedClient::default()
        }
    }
}

impl DynamicClient for ScriptedClient {
    fn load_assembly(&mut self, assembly: &str) -> Result<()> {
        self.assemblies.push(assembly.to_string());
        Ok(())
    }

    fn load_user_service(&mut self, service: &str, _args: Option<Value>) -> Result<()> {
        self.services.push(service.to_string());
        Ok(())
    }

    fn send(&mut self, message_id: u32, args: Vec<Value>) -> Result<Value> {
        self.sent.push((message_id, args));
        self.answers
            .pop_front()
            .ok_or_else(|| Error::Dynamic(format!("no scripted answer for message {message_id}")))
    }
}
