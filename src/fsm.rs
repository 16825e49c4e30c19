use rust_fsm::*;

#[derive(Debug)]
pub enum Action {
    Teardown,
}

#[derive(Debug, PartialEq)]
pub enum EngineState {
    Active,
    Poisoned,
    Released,
}

#[derive(Debug)]
pub enum EngineEvent {
    Operate,
    Fault,
    Release,
}

state_machine! {
    #[state_machine(input(crate::fsm::EngineEvent), state(crate::fsm::EngineState), output(crate::fsm::Action))]
    pub engine(Active)

    Active => {
        Operate => Active,
        Fault => Poisoned,
        Release => Released[Teardown],
    },
    Poisoned => {
        Fault => Poisoned,
        Release => Released[Teardown],
    }
}

#[cfg(test)]
mod tests {
    use super::engine::StateMachine;
    use super::*;

    #[test]
    fn poisoned_engine_rejects_operations() {
        let mut machine = StateMachine::new();
        assert!(machine.consume(&EngineEvent::Operate).unwrap().is_none());
        assert_eq!(machine.state(), &EngineState::Active);
        machine.consume(&EngineEvent::Fault).unwrap();
        assert_eq!(machine.state(), &EngineState::Poisoned);
        assert!(machine.consume(&EngineEvent::Operate).is_err());
        let action = machine.consume(&EngineEvent::Release).unwrap();
        assert!(matches!(action, Some(Action::Teardown)));
        assert_eq!(machine.state(), &EngineState::Released);
    }

    #[test]
    fn released_engine_is_terminal() {
        let mut machine = StateMachine::new();
        machine.consume(&EngineEvent::Release).unwrap();
        assert!(machine.consume(&EngineEvent::Operate).is_err());
        assert!(machine.consume(&EngineEvent::Release).is_err());
        assert!(machine.consume(&EngineEvent::Fault).is_err());
    }
}
