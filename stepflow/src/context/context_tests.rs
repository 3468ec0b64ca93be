//! Tests for the run context.

#[cfg(test)]
mod tests {
    use crate::context::{DataMap, RunContext, RunMetadata};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn data(value: serde_json::Value) -> DataMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_current_seeded_from_trigger() {
        let ctx = RunContext::new(data(json!({"order_id": 42})));
        assert_eq!(ctx.get("order_id"), Some(&json!(42)));
        assert_eq!(ctx.trigger().get("order_id"), Some(&json!(42)));
        assert!(ctx.step_outputs().is_empty());
    }

    #[test]
    fn test_merge_is_shallow_last_write_wins() {
        let mut ctx = RunContext::new(data(json!({"a": 1, "nested": {"x": 1, "y": 2}})));
        ctx.merge_step_output("s1", data(json!({"a": 2, "nested": {"x": 9}})));

        assert_eq!(ctx.get("a"), Some(&json!(2)));
        // the whole nested value is replaced, not merged
        assert_eq!(ctx.get("nested"), Some(&json!({"x": 9})));
        assert_eq!(ctx.trigger().get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_step_output_round_trip() {
        let mut ctx = RunContext::new(DataMap::new());
        let output = data(json!({"status": "ok", "rows": [1, 2]}));
        ctx.merge_step_output("fetch", output.clone());

        assert_eq!(ctx.step_output("fetch"), Some(&output));
        assert_eq!(ctx.get("status"), Some(&json!("ok")));
    }

    #[test]
    fn test_reinvocation_overwrites_step_output() {
        let mut ctx = RunContext::new(DataMap::new());
        ctx.merge_step_output("loop", data(json!({"n": 1})));
        ctx.merge_step_output("loop", data(json!({"m": 2})));

        assert_eq!(ctx.step_output("loop"), Some(&data(json!({"m": 2}))));
        // earlier merged keys stay in the working data
        assert_eq!(ctx.get("n"), Some(&json!(1)));
    }

    #[test]
    fn test_record_does_not_merge() {
        let mut ctx = RunContext::new(DataMap::new());
        ctx.record_step_output("bad", data(json!({"_skipped": true})));
        assert!(ctx.get("_skipped").is_none());
        assert!(ctx.step_output("bad").is_some());
    }

    #[test]
    fn test_lookup_prefixes() {
        let mut ctx = RunContext::new(data(json!({"user": {"name": "ada"}})));
        ctx.merge_step_output("fetch", data(json!({"rows": [{"id": 1}, {"id": 2}]})));
        ctx.metadata_mut().insert("pipeline", "orders");

        assert_eq!(ctx.lookup("user.name"), Some(json!("ada")));
        assert_eq!(ctx.lookup("steps.fetch.rows.1.id"), Some(json!(2)));
        assert_eq!(ctx.lookup("stepOutputs.fetch.rows.0.id"), Some(json!(1)));
        assert_eq!(ctx.lookup("trigger.user.name"), Some(json!("ada")));
        assert_eq!(ctx.lookup("meta.pipeline"), Some(json!("orders")));
        assert_eq!(ctx.lookup("steps.fetch"), Some(json!({"rows": [{"id": 1}, {"id": 2}]})));
        assert_eq!(ctx.lookup("steps.missing.rows"), None);
        assert_eq!(ctx.lookup("nope"), None);
    }

    #[test]
    fn test_fork_copies_current_and_resets_outputs() {
        let mut ctx = RunContext::new(data(json!({"a": 1})));
        ctx.merge_step_output("s", data(json!({"b": 2})));

        let mut sub = ctx.fork();
        assert_eq!(sub.run_id(), ctx.run_id());
        assert_eq!(sub.get("b"), Some(&json!(2)));
        assert!(sub.step_outputs().is_empty());

        sub.set("c", 3);
        assert!(ctx.get("c").is_none());
    }

    #[test]
    fn test_metadata_handles_downcast() {
        #[derive(Debug, PartialEq)]
        struct Writer(u8);

        let mut meta = RunMetadata::new();
        meta.insert_handle("writer", Arc::new(Writer(7)));

        assert_eq!(meta.handle::<Writer>("writer").as_deref(), Some(&Writer(7)));
        assert!(meta.handle::<String>("writer").is_none());
        assert!(meta.handle::<Writer>("other").is_none());
    }

    #[test]
    fn test_response_sent_flag() {
        let mut ctx = RunContext::new(DataMap::new());
        assert!(!ctx.metadata().response_sent());
        ctx.metadata_mut().mark_response_sent();
        assert!(ctx.metadata().response_sent());
    }
}
