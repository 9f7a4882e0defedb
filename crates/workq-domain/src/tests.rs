#[cfg(test)]
mod tests {
    use crate::files::*;
    use crate::types::*;

    #[test]
    fn pending_transition_matrix() {
        assert!(WorkItemState::Pending.can_transition_to(WorkItemState::Reserved));
        assert!(!WorkItemState::Pending.can_transition_to(WorkItemState::Completed));
        assert!(!WorkItemState::Pending.can_transition_to(WorkItemState::Failed));
        assert!(!WorkItemState::Pending.can_transition_to(WorkItemState::Pending));
    }

    #[test]
    fn reserved_transition_matrix() {
        assert!(WorkItemState::Reserved.can_transition_to(WorkItemState::Completed));
        assert!(WorkItemState::Reserved.can_transition_to(WorkItemState::Failed));
        assert!(WorkItemState::Reserved.can_transition_to(WorkItemState::Pending));
        assert!(!WorkItemState::Reserved.can_transition_to(WorkItemState::Reserved));
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for terminal in [WorkItemState::Completed, WorkItemState::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                WorkItemState::Pending,
                WorkItemState::Reserved,
                WorkItemState::Completed,
                WorkItemState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            WorkItemState::Pending,
            WorkItemState::Reserved,
            WorkItemState::Completed,
            WorkItemState::Failed,
        ] {
            assert_eq!(WorkItemState::parse(state.as_str()), Some(state));
        }
        assert_eq!(WorkItemState::parse("DONE"), None);
    }

    #[test]
    fn output_queue_name() {
        let q = QueueName::new("qa_forms");
        assert_eq!(q.output().as_str(), "qa_forms_output");
    }

    #[test]
    fn filename_length_boundary() {
        let ok = "a".repeat(255);
        let too_long = "a".repeat(256);
        assert!(validate_filename(&ok).is_ok());
        assert!(validate_filename(&too_long).is_err());
    }

    #[test]
    fn filename_rejects_path_separators() {
        assert!(validate_filename("etc/passwd").is_err());
        assert!(validate_filename("dir\\file.txt").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("report.pdf").is_ok());
    }

    #[test]
    fn file_size_boundary() {
        assert!(validate_file_size(MAX_FILE_SIZE).is_ok());
        assert!(validate_file_size(MAX_FILE_SIZE + 1).is_err());
    }

    #[test]
    fn exception_defaults() {
        let exc = WorkItemException::new("bad");
        assert_eq!(exc.type_or_default(), "UnknownException");
        assert_eq!(exc.code_or_default(), "");
        assert_eq!(exc.message, "bad");
    }

    #[test]
    fn exception_serializes_type_field() {
        let exc = WorkItemException {
            exception_type: Some("ValueError".into()),
            code: Some("E42".into()),
            message: "bad".into(),
        };
        let json = serde_json::to_value(&exc).unwrap();
        assert_eq!(json["type"], "ValueError");
        assert_eq!(json["code"], "E42");
        assert_eq!(json["message"], "bad");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = WorkItemId::generate();
        let b = WorkItemId::generate();
        assert_ne!(a, b);
    }
}
