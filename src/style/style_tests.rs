use super::*;

#[test]
fn set_then_get() {
  let sink = RecordingStyleSink::new();
  sink.set_style("mod:a", ".a { color: red; }");
  assert_eq!(sink.get("mod:a").as_deref(), Some(".a { color: red; }"));
}

#[test]
fn replace_in_place() {
  let sink = RecordingStyleSink::new();
  sink.set_style("mod:a", ".a { color: red; }");
  sink.set_style("mod:a", ".a { color: blue; }");
  assert_eq!(sink.get("mod:a").as_deref(), Some(".a { color: blue; }"));
}

#[test]
fn remove_clears_record() {
  let sink = RecordingStyleSink::new();
  sink.set_style("mod:a", ".a {}");
  sink.remove_style("mod:a");
  assert_eq!(sink.get("mod:a"), None);
}

#[test]
fn null_sink_discards_everything() {
  let sink = NullStyleSink;
  sink.set_style("mod:a", ".a {}");
}
