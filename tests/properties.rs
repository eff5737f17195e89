use detox::{
  CompileOptions, Emitter, InstructionKind::*, Node, TemplateError, Token, Value, compile, load,
};

fn render(nodes: &[Node], function: &str, args: Vec<Value>) -> String {
  let source = compile(nodes, &CompileOptions::default()).expect("template compiles");
  let module = load(&source, "test").expect("generated source loads");
  module
    .call(function, args)
    .and_then(|fragments| fragments.render())
    .expect("function renders")
}

fn branch_template() -> Vec<Node> {
  vec![
    Node::instruction(Def, "gurk(arg)"),
    Node::instruction(If, "arg>2"),
    Node::instruction(PrintExpr, "str(2*arg)"),
    Node::instruction(Else, ""),
    Node::instruction(PrintExpr, "str(3*arg)"),
    Node::instruction(EndIf, ""),
    Node::instruction(EndDef, ""),
  ]
}

#[test]
fn identity() {
  let nodes = vec![
    Node::instruction(Def, "gurk()"),
    Node::text("foo"),
    Node::instruction(EndDef, ""),
  ];
  assert_eq!(render(&nodes, "gurk", vec![]), "foo");
}

#[test]
fn repeated_calls_render_identically() {
  let source = compile(&branch_template(), &CompileOptions::default()).expect("compiles");
  let module = load(&source, "test").expect("loads");
  let first = module.call("gurk", [Value::Int(4)]).and_then(|f| f.render());
  let second = module.call("gurk", [Value::Int(4)]).and_then(|f| f.render());
  assert_eq!(first.expect("first call"), second.expect("second call"));

  let again = compile(&branch_template(), &CompileOptions::default()).expect("compiles");
  assert_eq!(source.as_str(), again.as_str());
}

#[test]
fn loop_body_runs_per_item() {
  let nodes = vec![
    Node::instruction(Def, "gurk(arg)"),
    Node::instruction(For, "i in range(arg)"),
    Node::instruction(PrintExpr, "str(i)"),
    Node::instruction(EndFor, ""),
    Node::instruction(EndDef, ""),
  ];
  assert_eq!(render(&nodes, "gurk", vec![Value::Int(3)]), "012");
  assert_eq!(render(&nodes, "gurk", vec![Value::Int(0)]), "");
}

#[test]
fn branch_boundary() {
  let nodes = branch_template();
  for (arg, expected) in [(0, "0"), (1, "3"), (2, "6"), (3, "6"), (4, "8")] {
    assert_eq!(render(&nodes, "gurk", vec![Value::Int(arg)]), expected, "arg={arg}");
  }
}

#[test]
fn end_any_closes_whatever_is_open() {
  let nodes = vec![
    Node::instruction(Def, "gurk()"),
    Node::instruction(For, "c in 'ab'"),
    Node::instruction(PrintExpr, "c"),
    Node::instruction(EndAny, ""),
    Node::text("!"),
    Node::instruction(EndAny, ""),
    Node::instruction(Def, "other()"),
    Node::text("x"),
    Node::instruction(EndAny, ""),
  ];
  assert_eq!(render(&nodes, "gurk", vec![]), "ab!");
  assert_eq!(render(&nodes, "other", vec![]), "x");
}

#[test]
fn mismatched_end_leaves_the_stack_alone() {
  let mut emitter = Emitter::new(CompileOptions::default());
  emitter.process(Token::new(Def, "gurk()")).expect("def opens");
  let err = emitter.process(Token::new(EndFor, "")).unwrap_err();
  assert!(matches!(
    err,
    TemplateError::ScopeMismatch {
      closing: Some(EndFor),
      ..
    }
  ));
  assert_eq!(err.to_string(), "can't end for scope: active scope is: def gurk()");
  assert_eq!(emitter.depth(), 1);
  assert_eq!(emitter.stack()[0].kind, Def);
  assert_eq!(emitter.stack()[0].header, "gurk()");

  emitter.process(Token::new(EndDef, "")).expect("the original frame still closes");
  assert_eq!(emitter.depth(), 0);
}

#[test]
fn end_on_an_empty_stack_fails() {
  let nodes = vec![Node::instruction(EndAny, "")];
  let err = compile(&nodes, &CompileOptions::default()).unwrap_err();
  assert_eq!(err.to_string(), "can't end unnamed scope: no active scope");
}

#[test]
fn escaping_directives() {
  let nodes = vec![
    Node::instruction(Def, "gurk(value)"),
    Node::instruction(PrintEscapedText, "value"),
    Node::text("|"),
    Node::instruction(PrintEscapedAttr, "value"),
    Node::instruction(EndDef, ""),
  ];
  assert_eq!(
    render(&nodes, "gurk", vec![Value::from("<&>\"")]),
    "&lt;&amp;&gt;\"|&lt;&amp;&gt;&quot;"
  );
}

#[test]
fn output_outside_any_def_is_suppressed() {
  let nodes = vec![
    Node::text("dropped"),
    Node::instruction(PrintExpr, "undefined_name"),
    Node::instruction(Def, "gurk()"),
    Node::text("kept"),
    Node::instruction(EndDef, ""),
    Node::text("also dropped"),
  ];
  let source = compile(&nodes, &CompileOptions::default()).expect("compiles");
  assert!(!source.as_str().contains("dropped"));
  assert!(!source.as_str().contains("undefined_name"));
  assert_eq!(render(&nodes, "gurk", vec![]), "kept");
}
