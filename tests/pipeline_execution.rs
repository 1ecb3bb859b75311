use as4_engine::app_context::AppContext;
use as4_engine::pipeline::{
    ConditionalStep, FailureCategory, MessagingContext, Pipeline, PipelineOutcome,
    ProcessingError, Step, StepConfiguration, StepError, StepResult,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

type Journal = Arc<Mutex<Vec<String>>>;

enum Behaviour {
    Continue,
    Stop,
    Fail,
    Fault,
}

struct Recording {
    name: &'static str,
    behaviour: Behaviour,
    journal: Journal,
}

impl Recording {
    fn step(name: &'static str, behaviour: Behaviour, journal: &Journal) -> Arc<dyn Step> {
        Arc::new(Self {
            name,
            behaviour,
            journal: Arc::clone(journal),
        })
    }
}

#[async_trait]
impl Step for Recording {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _app: &AppContext,
    ) -> Result<StepResult, StepError> {
        let seen_error = context
            .error()
            .map(|error| format!(" [{}]", error.description))
            .unwrap_or_default();
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}{seen_error}", self.name));
        match self.behaviour {
            Behaviour::Continue => Ok(StepResult::Continue),
            Behaviour::Stop => Ok(StepResult::Stop),
            Behaviour::Fail => Ok(StepResult::Failed(
                ProcessingError::delivery("sink refused").referencing("m-1"),
            )),
            Behaviour::Fault => Err(StepError::msg("row vanished")),
        }
    }
}

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

async fn run(pipeline: &Pipeline) -> (PipelineOutcome, MessagingContext) {
    let app = AppContext::builder().build();
    let mut context = MessagingContext::new();
    let outcome = pipeline.run(&mut context, &app).await;
    (outcome, context)
}

#[tokio::test]
async fn steps_run_in_declared_order() {
    let log = journal();
    let pipeline = Pipeline::new(
        "ordered",
        StepConfiguration::new(
            vec![
                Recording::step("first", Behaviour::Continue, &log),
                Recording::step("second", Behaviour::Continue, &log),
                Recording::step("third", Behaviour::Continue, &log),
            ],
            vec![Recording::step("on_error", Behaviour::Continue, &log)],
        ),
    );

    let (outcome, context) = run(&pipeline).await;

    assert_eq!(outcome, PipelineOutcome::Completed);
    assert!(!context.has_error());
    assert_eq!(entries(&log), vec!["first", "second", "third"]);
    assert_eq!(
        pipeline.steps().step_names(),
        vec!["first", "second", "third"]
    );
}

#[tokio::test]
async fn stop_skips_the_rest_and_counts_as_success() {
    let log = journal();
    let pipeline = Pipeline::new(
        "stopping",
        StepConfiguration::new(
            vec![
                Recording::step("first", Behaviour::Stop, &log),
                Recording::step("second", Behaviour::Continue, &log),
            ],
            vec![Recording::step("on_error", Behaviour::Continue, &log)],
        ),
    );

    let (outcome, _) = run(&pipeline).await;

    assert_eq!(
        outcome,
        PipelineOutcome::Stopped {
            step: "first".to_string()
        }
    );
    assert!(outcome.is_success());
    assert_eq!(entries(&log), vec!["first"]);
}

#[tokio::test]
async fn failure_diverts_to_the_error_steps_with_the_error_attached() {
    let log = journal();
    let pipeline = Pipeline::new(
        "failing",
        StepConfiguration::new(
            vec![
                Recording::step("first", Behaviour::Continue, &log),
                Recording::step("deliver", Behaviour::Fail, &log),
                Recording::step("never", Behaviour::Continue, &log),
            ],
            vec![
                Recording::step("create_error", Behaviour::Continue, &log),
                Recording::step("respond", Behaviour::Continue, &log),
            ],
        ),
    );

    let (outcome, context) = run(&pipeline).await;

    let PipelineOutcome::Failed { step, error } = &outcome else {
        panic!("expected failure, got {outcome}");
    };
    assert_eq!(step, "deliver");
    assert_eq!(error.category, FailureCategory::Delivery);
    assert_eq!(error.ref_message_id.as_deref(), Some("m-1"));
    assert!(!outcome.is_success());
    assert_eq!(context.error(), Some(error));
    assert_eq!(
        entries(&log),
        vec![
            "first",
            "deliver",
            "create_error [sink refused]",
            "respond [sink refused]",
        ]
    );
}

#[tokio::test]
async fn fault_is_contained_and_reported_as_unexpected() {
    let log = journal();
    let pipeline = Pipeline::new(
        "faulting",
        StepConfiguration::new(
            vec![
                Recording::step("load", Behaviour::Fault, &log),
                Recording::step("never", Behaviour::Continue, &log),
            ],
            vec![Recording::step("on_error", Behaviour::Continue, &log)],
        ),
    );

    let (outcome, _) = run(&pipeline).await;

    let PipelineOutcome::Faulted { step, error } = &outcome else {
        panic!("expected fault, got {outcome}");
    };
    assert_eq!(step, "load");
    assert_eq!(error.category, FailureCategory::Unexpected);
    assert!(error.description.contains("row vanished"));
    assert_eq!(entries(&log), vec!["load", "on_error [row vanished]"]);
}

#[tokio::test]
async fn failing_error_step_abandons_the_remaining_error_steps() {
    let log = journal();
    let pipeline = Pipeline::new(
        "failing_twice",
        StepConfiguration::new(
            vec![Recording::step("deliver", Behaviour::Fail, &log)],
            vec![
                Recording::step("create_error", Behaviour::Fault, &log),
                Recording::step("respond", Behaviour::Continue, &log),
            ],
        ),
    );

    let (outcome, _) = run(&pipeline).await;

    assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
    assert_eq!(
        entries(&log),
        vec!["deliver", "create_error [sink refused]"]
    );
}

fn has_message(context: &MessagingContext) -> bool {
    context.as4_message.is_some()
}

#[tokio::test]
async fn conditional_steps_run_only_when_their_condition_holds() {
    let log = journal();
    let pipeline = Pipeline::new(
        "conditional",
        StepConfiguration::new(
            vec![
                Arc::new(ConditionalStep::new(
                    "has_message",
                    has_message,
                    false,
                    Recording::step("with_message", Behaviour::Continue, &log),
                )) as Arc<dyn Step>,
                Arc::new(ConditionalStep::new(
                    "has_message",
                    has_message,
                    true,
                    Recording::step("without_message", Behaviour::Continue, &log),
                )),
            ],
            Vec::new(),
        ),
    );

    let (outcome, _) = run(&pipeline).await;

    assert_eq!(outcome, PipelineOutcome::Completed);
    assert_eq!(entries(&log), vec!["without_message"]);
    assert_eq!(
        pipeline.steps().step_names(),
        vec!["with_message", "without_message"]
    );
}
