//! Orchestration definitions: ordered steps of commands plus a fallback.

use message_store::{Message, MessageId, OrchestrationId, OrchestrationLink};

use crate::error::{Result, SagaError};

/// One step of an orchestration. Its number is its position.
#[derive(Debug, Clone)]
pub struct OrchestrationStep {
    pub name: String,
    pub commands: Vec<Message>,
}

/// A saga definition.
///
/// Every command of a step must complete before the next step is
/// dispatched. When any command completes with an error, the fallback
/// step runs and whatever was not dispatched yet is canceled.
#[derive(Debug, Clone)]
pub struct MessageOrchestration {
    pub id: OrchestrationId,
    pub name: String,
    pub steps: Vec<OrchestrationStep>,
    pub fallback: Option<OrchestrationStep>,
}

impl MessageOrchestration {
    /// Creates an empty orchestration with a fresh ID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: OrchestrationId::new(),
            name: name.into(),
            steps: Vec::new(),
            fallback: None,
        }
    }

    /// Appends a step, linking each command to it.
    pub fn add_step(&mut self, name: impl Into<String>, commands: Vec<Message>) -> &mut Self {
        let name = name.into();
        let number = self.steps.len() as i32;
        let commands = commands
            .into_iter()
            .map(|command| {
                command.with_orchestration(OrchestrationLink::step(self.id, &self.name, &name, number))
            })
            .collect();

        self.steps.push(OrchestrationStep { name, commands });
        self
    }

    /// Sets the compensation step, linking each command to it.
    pub fn set_fallback(&mut self, name: impl Into<String>, commands: Vec<Message>) -> &mut Self {
        let name = name.into();
        let commands = commands
            .into_iter()
            .map(|command| {
                command.with_orchestration(OrchestrationLink::fallback(self.id, &self.name, &name))
            })
            .collect();

        self.fallback = Some(OrchestrationStep { name, commands });
        self
    }

    /// All commands, normal steps in order and the fallback last.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.steps
            .iter()
            .chain(self.fallback.iter())
            .flat_map(|step| step.commands.iter())
    }

    pub fn message_count(&self) -> usize {
        self.messages().count()
    }

    /// Checks that a fallback step exists, possibly with no commands, and
    /// every command is linked to the step it sits in.
    pub fn validate(&self) -> Result<()> {
        let fallback = self
            .fallback
            .as_ref()
            .ok_or_else(|| SagaError::MissingFallback(self.name.clone()))?;

        for (number, step) in self.steps.iter().enumerate() {
            let expected = OrchestrationLink::step(self.id, &self.name, &step.name, number as i32);
            self.check_links(step, &expected)?;
        }

        let expected = OrchestrationLink::fallback(self.id, &self.name, &fallback.name);
        self.check_links(fallback, &expected)
    }

    fn check_links(&self, step: &OrchestrationStep, expected: &OrchestrationLink) -> Result<()> {
        match step
            .commands
            .iter()
            .find(|command| command.orchestration.as_ref() != Some(expected))
        {
            Some(command) => Err(SagaError::MissingLinkage {
                orchestration_id: self.id,
                step: step.name.clone(),
                method: command.method.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Stores repository-assigned IDs, in [`MessageOrchestration::messages`] order.
    pub(crate) fn assign_ids(&mut self, ids: &[MessageId]) {
        let commands = self
            .steps
            .iter_mut()
            .chain(self.fallback.iter_mut())
            .flat_map(|step| step.commands.iter_mut());

        for (command, id) in commands.zip(ids) {
            command.id = Some(*id);
        }
    }
}
