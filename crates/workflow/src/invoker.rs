use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use leadflow_agent::{AgentRuntime, ExecuteOptions, LlmClient};
use leadflow_core::domain::agent::{AgentExecutionStatus, AgentId};
use leadflow_core::domain::lead::LeadId;
use leadflow_core::domain::workflow::{Context, WorkflowExecutionId};
use leadflow_db::repositories::LeadStore;

use crate::errors::AgentInvocationError;

const GENERAL_AGENT_CONFIDENCE: f64 = 0.8;
const NO_LEAD_DATA: &str = "No lead data available";

const QUALIFIER_INSTRUCTIONS: &str = "You are a lead qualification agent for a CRM system.
Analyze the lead for communication responsiveness, business fit, urgency signals, budget \
indicators and decision-making authority.
Give a score from 0 to 100 and a classification of COLD, WARM or HOT, then suggest next actions \
and a priority level.
Reply with one JSON object only:
{\"score\": 85, \"classification\": \"HOT\", \"priority\": \"HIGH\", \"reasoning\": \"...\", \
\"next_actions\": [\"Schedule demo\"], \"confidence\": 0.9}";

const MESSAGE_INSTRUCTIONS: &str = "You are a message generation agent for a CRM system.
Write a personalized message for the lead: professional but conversational, concise, with a \
clear call to action.
Reply with one JSON object only:
{\"message\": \"...\", \"subject\": \"...\", \"message_type\": \"follow_up\", \"tone\": \"professional\", \
\"call_to_action\": \"Schedule a call\", \"confidence\": 0.9, \"suggested_timing\": \"immediate\"}";

const FOLLOW_UP_INSTRUCTIONS: &str = "You are a follow-up scheduling agent for a CRM system.
Decide when and over which channel the lead should be contacted next.
Reply with one JSON object only:
{\"follow_up_in_hours\": 48, \"channel\": \"email\", \"reason\": \"...\", \"confidence\": 0.9}";

/// Agent roles an `ai_agent` node selects through `agentType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentType {
    General,
    LeadQualifier,
    MessageGenerator,
    FollowUpScheduler,
}

impl AgentType {
    /// Unrecognised names are served by the general agent.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "lead_qualifier" => Self::LeadQualifier,
            "message_generator" => Self::MessageGenerator,
            "follow_up_scheduler" => Self::FollowUpScheduler,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::LeadQualifier => "lead_qualifier",
            Self::MessageGenerator => "message_generator",
            Self::FollowUpScheduler => "follow_up_scheduler",
        }
    }
}

/// Everything an `ai_agent` node hands to the agent that serves it.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentInvocation {
    pub execution_id: WorkflowExecutionId,
    pub node_id: String,
    pub lead_id: Option<String>,
    pub agent_type: String,
    pub agent_id: Option<String>,
    pub prompt: String,
    pub variables: Context,
    pub settings: Value,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<Value, AgentInvocationError>;
}

/// Runs an installed agent through the runtime, one session per workflow execution.
pub struct RuntimeAgentInvoker {
    runtime: AgentRuntime,
    user_id: String,
}

impl RuntimeAgentInvoker {
    pub fn new(runtime: AgentRuntime, user_id: impl Into<String>) -> Self {
        Self { runtime, user_id: user_id.into() }
    }
}

#[async_trait]
impl AgentInvoker for RuntimeAgentInvoker {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<Value, AgentInvocationError> {
        let agent_id = invocation.agent_id.clone().ok_or(AgentInvocationError::MissingAgentId)?;
        let input = json!({
            "prompt": invocation.prompt,
            "leadId": invocation.lead_id,
            "agentType": invocation.agent_type,
            "variables": invocation.variables,
            "settings": invocation.settings,
            "nodeId": invocation.node_id,
            "workflowExecutionId": invocation.execution_id.0,
        });

        let execution_id = self
            .runtime
            .execute_agent(
                &self.user_id,
                &AgentId(agent_id),
                input,
                ExecuteOptions { session_id: Some(invocation.execution_id.0.clone()) },
            )
            .await?;
        let finished = self.runtime.wait_for_completion(&execution_id).await?;

        debug!(
            event_name = "workflow.agent.finished",
            workflow_execution_id = %invocation.execution_id,
            agent_execution_id = %execution_id,
            status = finished.status.as_str(),
            "agent invocation finished"
        );

        match finished.status {
            AgentExecutionStatus::Completed => Ok(match finished.output {
                Some(Value::Object(entries)) => Value::Object(entries),
                other => json!({ "response": other.unwrap_or(Value::Null) }),
            }),
            status => Err(AgentInvocationError::ExecutionFailed {
                status: status.as_str().to_string(),
                message: finished.error.unwrap_or_else(|| "no error reported".to_string()),
            }),
        }
    }
}

/// LLM-backed agents. `general` is a single completion of the rendered prompt; the other
/// [`AgentType`]s wrap it in role instructions plus the lead profile and expect a JSON reply.
pub struct LlmAgentInvoker<C> {
    client: C,
    leads: Option<Arc<dyn LeadStore>>,
}

impl<C: LlmClient> LlmAgentInvoker<C> {
    pub fn new(client: C) -> Self {
        Self { client, leads: None }
    }

    /// Lets role agents read the lead they are working on.
    pub fn with_leads(mut self, leads: Arc<dyn LeadStore>) -> Self {
        self.leads = Some(leads);
        self
    }

    async fn complete(&self, prompt: &str) -> Result<String, AgentInvocationError> {
        self.client
            .complete(prompt)
            .await
            .map_err(|error| AgentInvocationError::Llm(error.to_string()))
    }

    async fn lead_profile(&self, lead_id: Option<&str>) -> String {
        let (Some(leads), Some(lead_id)) = (&self.leads, lead_id) else {
            return NO_LEAD_DATA.to_string();
        };

        match leads.find_lead(&LeadId(lead_id.to_string())).await {
            Ok(Some(lead)) => format!(
                "Name: {}\nEmail: {}\nPhone: {}\nStatus: {}\nPriority: {}\nAI score: {}",
                lead.name,
                lead.email.as_deref().unwrap_or("Not provided"),
                lead.phone.as_deref().unwrap_or("Not provided"),
                lead.status,
                lead.priority.as_deref().unwrap_or("Unknown"),
                lead.ai_score.map(|score| score.to_string()).unwrap_or_else(|| "None".to_string()),
            ),
            Ok(None) => NO_LEAD_DATA.to_string(),
            Err(error) => {
                warn!(
                    event_name = "workflow.agent.lead_lookup_failed",
                    lead_id,
                    error = %error,
                    "could not load lead for agent prompt"
                );
                NO_LEAD_DATA.to_string()
            }
        }
    }

    async fn role_agent(
        &self,
        agent_type: AgentType,
        invocation: &AgentInvocation,
    ) -> Result<Value, AgentInvocationError> {
        let profile = self.lead_profile(invocation.lead_id.as_deref()).await;
        let message_type = invocation
            .variables
            .get("message_type")
            .and_then(Value::as_str)
            .unwrap_or("follow_up");

        let (instructions, default_task) = match agent_type {
            AgentType::LeadQualifier => {
                (QUALIFIER_INSTRUCTIONS, "Standard lead qualification analysis")
            }
            AgentType::MessageGenerator => {
                (MESSAGE_INSTRUCTIONS, "Generate a contextual message for this lead")
            }
            AgentType::FollowUpScheduler => {
                (FOLLOW_UP_INSTRUCTIONS, "Plan the next follow-up for this lead")
            }
            AgentType::General => return self.general(invocation).await,
        };
        let task = match invocation.prompt.trim() {
            "" => default_task,
            prompt => prompt,
        };

        let mut prompt =
            format!("{instructions}\n\nContext: {task}\n\nLead information:\n{profile}\n");
        if agent_type == AgentType::MessageGenerator {
            prompt.push_str(&format!("\nMessage type: {message_type}\n"));
        }

        let reply = self.complete(&prompt).await?;
        let parsed = match agent_type {
            AgentType::LeadQualifier => {
                parse_reply::<Qualification>(&reply).and_then(Qualification::into_output)
            }
            AgentType::MessageGenerator => {
                parse_reply::<MessageDraft>(&reply).map(|draft| draft.into_output(message_type))
            }
            _ => parse_reply::<FollowUpPlan>(&reply).map(FollowUpPlan::into_output),
        };

        let mut output = match parsed {
            Ok(output) => output,
            Err(reason) => {
                warn!(
                    event_name = "workflow.agent.reply_rejected",
                    workflow_execution_id = %invocation.execution_id,
                    node_id = %invocation.node_id,
                    agent_type = agent_type.as_str(),
                    reason = %reason,
                    "agent reply did not match its schema"
                );
                let mut fallback = Map::new();
                fallback
                    .insert("error".to_string(), json!(format!("unusable agent reply: {reason}")));
                fallback.insert("confidence".to_string(), json!(0.0));
                fallback
            }
        };
        output.insert("agentType".to_string(), json!(agent_type.as_str()));
        output.insert("leadId".to_string(), json!(invocation.lead_id));
        output.insert("modelUsed".to_string(), json!(self.client.model_name()));
        Ok(Value::Object(output))
    }

    async fn general(&self, invocation: &AgentInvocation) -> Result<Value, AgentInvocationError> {
        let response = self.complete(&invocation.prompt).await?;

        Ok(json!({
            "response": response,
            "confidence": GENERAL_AGENT_CONFIDENCE,
            "modelUsed": self.client.model_name(),
        }))
    }
}

#[async_trait]
impl<C: LlmClient> AgentInvoker for LlmAgentInvoker<C> {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<Value, AgentInvocationError> {
        match AgentType::parse(&invocation.agent_type) {
            AgentType::General => self.general(&invocation).await,
            agent_type => self.role_agent(agent_type, &invocation).await,
        }
    }
}

/// Pulls the outermost JSON object out of a reply, tolerating code fences and chatter.
fn parse_reply<T: DeserializeOwned>(reply: &str) -> Result<T, String> {
    let body = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => return Err("reply holds no JSON object".to_string()),
    };
    serde_json::from_str(body).map_err(|error| error.to_string())
}

#[derive(Debug, Deserialize)]
struct Qualification {
    score: f64,
    classification: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    next_actions: Vec<String>,
    confidence: f64,
}

impl Qualification {
    fn into_output(self) -> Result<Map<String, Value>, String> {
        let classification = self.classification.trim().to_ascii_uppercase();
        if !matches!(classification.as_str(), "COLD" | "WARM" | "HOT") {
            return Err(format!("unknown classification `{}`", self.classification));
        }

        let mut output = Map::new();
        output.insert("score".to_string(), json!(self.score.clamp(0.0, 100.0)));
        output.insert("classification".to_string(), json!(classification));
        output.insert("priority".to_string(), json!(self.priority));
        output.insert("next_actions".to_string(), json!(self.next_actions));
        output.insert("confidence".to_string(), json!(self.confidence.clamp(0.0, 1.0)));
        output.insert("response".to_string(), json!(self.reasoning));
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct MessageDraft {
    message: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    tone: Option<String>,
    #[serde(default)]
    call_to_action: Option<String>,
    #[serde(default)]
    suggested_timing: Option<String>,
    confidence: f64,
}

impl MessageDraft {
    fn into_output(self, requested_type: &str) -> Map<String, Value> {
        let mut output = Map::new();
        output.insert("message".to_string(), json!(self.message));
        output.insert("subject".to_string(), json!(self.subject));
        output.insert(
            "message_type".to_string(),
            json!(self.message_type.unwrap_or_else(|| requested_type.to_string())),
        );
        output.insert("tone".to_string(), json!(self.tone));
        output.insert("call_to_action".to_string(), json!(self.call_to_action));
        output.insert("suggested_timing".to_string(), json!(self.suggested_timing));
        output.insert("confidence".to_string(), json!(self.confidence.clamp(0.0, 1.0)));
        output.insert("response".to_string(), json!(self.message));
        output
    }
}

#[derive(Debug, Deserialize)]
struct FollowUpPlan {
    follow_up_in_hours: u32,
    channel: String,
    #[serde(default)]
    reason: String,
    confidence: f64,
}

impl FollowUpPlan {
    fn into_output(self) -> Map<String, Value> {
        let mut output = Map::new();
        output.insert("follow_up_in_hours".to_string(), json!(self.follow_up_in_hours));
        output.insert("channel".to_string(), json!(self.channel));
        output.insert("confidence".to_string(), json!(self.confidence.clamp(0.0, 1.0)));
        output.insert("response".to_string(), json!(self.reason));
        output
    }
}

/// Sends invocations naming an installed agent to the runtime. Everything else goes to the LLM
/// agents, which pick a role from `agentType`.
pub struct RoutingAgentInvoker {
    installed: Arc<dyn AgentInvoker>,
    general: Arc<dyn AgentInvoker>,
}

impl RoutingAgentInvoker {
    pub fn new(installed: Arc<dyn AgentInvoker>, general: Arc<dyn AgentInvoker>) -> Self {
        Self { installed, general }
    }
}

#[async_trait]
impl AgentInvoker for RoutingAgentInvoker {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<Value, AgentInvocationError> {
        if invocation.agent_id.is_some() {
            self.installed.invoke(invocation).await
        } else {
            self.general.invoke(invocation).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use leadflow_agent::{AgentRuntime, LlmClient, RuntimeConfig};
    use leadflow_core::domain::agent::{AgentId, AgentManifest, ResourceLimits};
    use leadflow_core::domain::lead::{Lead, LeadId};
    use leadflow_core::domain::workflow::WorkflowExecutionId;
    use leadflow_core::events::NoopEventSink;
    use leadflow_db::repositories::{InMemoryAgentExecutionRepository, InMemoryLeadStore};

    use super::{
        AgentInvocation, AgentInvoker, AgentType, LlmAgentInvoker, RoutingAgentInvoker,
        RuntimeAgentInvoker,
    };
    use crate::errors::AgentInvocationError;

    struct CannedLlm;

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("echo: {prompt}"))
        }

        fn model_name(&self) -> &str {
            "canned-1"
        }
    }

    /// Answers every prompt with one reply and keeps the prompts it was sent.
    struct ScriptedLlm {
        reply: &'static str,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedLlm {
        fn new(reply: &'static str) -> (Self, Arc<Mutex<Vec<String>>>) {
            let prompts = Arc::new(Mutex::new(Vec::new()));
            (Self { reply, prompts: prompts.clone() }, prompts)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
            self.prompts.lock().expect("prompts").push(prompt.to_string());
            Ok(self.reply.to_string())
        }

        fn model_name(&self) -> &str {
            "scripted-1"
        }
    }

    fn typed(agent_type: &str) -> AgentInvocation {
        AgentInvocation { agent_type: agent_type.to_string(), ..invocation(None) }
    }

    async fn leads() -> Arc<InMemoryLeadStore> {
        let leads = Arc::new(InMemoryLeadStore::default());
        let mut lead = Lead::new(LeadId("lead-1".to_string()), "Ada Lovelace");
        lead.email = Some("ada@example.com".to_string());
        leads.insert(lead).await;
        leads
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl AgentInvoker for Fixed {
        async fn invoke(&self, _invocation: AgentInvocation) -> Result<Value, AgentInvocationError> {
            Ok(json!({ "route": self.0 }))
        }
    }

    fn invocation(agent_id: Option<&str>) -> AgentInvocation {
        let mut variables = Map::new();
        variables.insert("leadId".to_string(), json!("lead-1"));
        AgentInvocation {
            execution_id: WorkflowExecutionId("wf-exec-1".to_string()),
            node_id: "analyze".to_string(),
            lead_id: Some("lead-1".to_string()),
            agent_type: "general".to_string(),
            agent_id: agent_id.map(str::to_string),
            prompt: "Score lead lead-1".to_string(),
            variables,
            settings: Value::Null,
        }
    }

    async fn runtime_with(code: &str) -> AgentRuntime {
        let runtime = AgentRuntime::new(
            RuntimeConfig::default(),
            Arc::new(InMemoryAgentExecutionRepository::default()),
            Arc::new(NoopEventSink),
        );
        runtime
            .install_agent(
                "admin",
                AgentManifest {
                    id: AgentId("scorer".to_string()),
                    name: "Scorer".to_string(),
                    version: "1.0.0".to_string(),
                    permissions: BTreeSet::new(),
                    resource_limits: ResourceLimits::default(),
                    code: code.to_string(),
                    triggers: Vec::new(),
                },
            )
            .await
            .expect("install");
        runtime
    }

    #[tokio::test]
    async fn general_agent_reports_model_and_confidence() {
        let output = LlmAgentInvoker::new(CannedLlm).invoke(invocation(None)).await.expect("invoke");

        assert_eq!(output["response"], "echo: Score lead lead-1");
        assert_eq!(output["confidence"], json!(0.8));
        assert_eq!(output["modelUsed"], "canned-1");
    }

    #[tokio::test]
    async fn lead_qualifier_reply_becomes_score_classification_and_confidence() {
        let (llm, prompts) = ScriptedLlm::new(
            "```json\n{\"score\": 120, \"classification\": \"hot\", \"priority\": \"HIGH\", \
             \"reasoning\": \"Asked for pricing twice\", \"next_actions\": [\"Send pricing\"], \
             \"confidence\": 0.92}\n```",
        );
        let invoker = LlmAgentInvoker::new(llm).with_leads(leads().await);

        let output = invoker.invoke(typed("lead_qualifier")).await.expect("qualify");

        assert_eq!(output["score"], json!(100.0));
        assert_eq!(output["classification"], "HOT");
        assert_eq!(output["priority"], "HIGH");
        assert_eq!(output["next_actions"], json!(["Send pricing"]));
        assert_eq!(output["confidence"], json!(0.92));
        assert_eq!(output["response"], "Asked for pricing twice");
        assert_eq!(output["agentType"], "lead_qualifier");
        assert_eq!(output["modelUsed"], "scripted-1");

        let prompts = prompts.lock().expect("prompts");
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("COLD, WARM or HOT"));
        assert!(prompts[0].contains("Context: Score lead lead-1"));
        assert!(prompts[0].contains("Name: Ada Lovelace"));
        assert!(prompts[0].contains("Email: ada@example.com"));
    }

    #[tokio::test]
    async fn unusable_role_replies_score_zero_confidence() {
        for reply in [
            "I think this lead is hot!",
            r#"{"score": 70, "classification": "LUKEWARM", "confidence": 0.9}"#,
            r#"{"classification": "HOT", "confidence": 0.9}"#,
        ] {
            let (llm, _) = ScriptedLlm::new(reply);
            let output = LlmAgentInvoker::new(llm)
                .invoke(typed("lead_qualifier"))
                .await
                .expect("fallback output");

            assert_eq!(output["confidence"], json!(0.0), "reply `{reply}`");
            assert!(output["error"].as_str().unwrap_or_default().starts_with("unusable agent reply"));
            assert_eq!(output["agentType"], "lead_qualifier");
        }
    }

    #[tokio::test]
    async fn message_generator_and_follow_up_scheduler_have_their_own_replies() {
        let (llm, prompts) =
            ScriptedLlm::new(r#"{"message": "Hi Ada, are you free Thursday?", "confidence": 0.7}"#);
        let mut request = typed("message_generator");
        request.prompt = String::new();
        request.variables.insert("message_type".to_string(), json!("welcome"));

        let draft = LlmAgentInvoker::new(llm).invoke(request).await.expect("draft");
        assert_eq!(draft["message"], "Hi Ada, are you free Thursday?");
        assert_eq!(draft["response"], "Hi Ada, are you free Thursday?");
        assert_eq!(draft["message_type"], "welcome");
        assert_eq!(draft["confidence"], json!(0.7));
        let sent = prompts.lock().expect("prompts")[0].clone();
        assert!(sent.contains("Context: Generate a contextual message for this lead"));
        assert!(sent.contains("Message type: welcome"));
        assert!(sent.contains("No lead data available"));

        let (llm, _) = ScriptedLlm::new(
            r#"{"follow_up_in_hours": 48, "channel": "email", "reason": "Waiting on budget", "confidence": 1.4}"#,
        );
        let plan = LlmAgentInvoker::new(llm).invoke(typed("follow_up_scheduler")).await.expect("plan");
        assert_eq!(plan["follow_up_in_hours"], 48);
        assert_eq!(plan["channel"], "email");
        assert_eq!(plan["response"], "Waiting on budget");
        assert_eq!(plan["confidence"], json!(1.0));
    }

    #[test]
    fn unknown_agent_types_fall_back_to_general() {
        assert_eq!(AgentType::parse("lead_qualifier"), AgentType::LeadQualifier);
        assert_eq!(AgentType::parse(" follow_up_scheduler "), AgentType::FollowUpScheduler);
        assert_eq!(AgentType::parse("sentiment"), AgentType::General);
        assert_eq!(AgentType::MessageGenerator.as_str(), "message_generator");
    }

    #[tokio::test]
    async fn general_type_sends_the_prompt_unwrapped() {
        let (llm, prompts) = ScriptedLlm::new("plain answer");
        let output = LlmAgentInvoker::new(llm)
            .with_leads(leads().await)
            .invoke(typed("sentiment"))
            .await
            .expect("general");

        assert_eq!(output["response"], "plain answer");
        assert_eq!(output["confidence"], json!(0.8));
        assert_eq!(*prompts.lock().expect("prompts"), vec!["Score lead lead-1".to_string()]);
    }

    #[tokio::test]
    async fn routing_depends_on_agent_id() {
        let router = RoutingAgentInvoker::new(Arc::new(Fixed("installed")), Arc::new(Fixed("general")));

        let routed = router.invoke(invocation(Some("scorer"))).await.expect("installed");
        assert_eq!(routed["route"], "installed");
        let routed = router.invoke(invocation(None)).await.expect("general");
        assert_eq!(routed["route"], "general");
    }

    #[tokio::test]
    async fn installed_agent_objects_pass_through_and_scalars_are_wrapped() {
        let objects = RuntimeAgentInvoker::new(
            runtime_with(r#"#{ leadId: input.leadId, session: "ok" }"#).await,
            "workflow",
        );
        let output = objects.invoke(invocation(Some("scorer"))).await.expect("object");
        assert_eq!(output, json!({ "leadId": "lead-1", "session": "ok" }));

        let scalars = RuntimeAgentInvoker::new(runtime_with("40 + 2").await, "workflow");
        let output = scalars.invoke(invocation(Some("scorer"))).await.expect("scalar");
        assert_eq!(output, json!({ "response": 42 }));
    }

    #[tokio::test]
    async fn failed_agent_execution_is_an_invocation_error() {
        let invoker =
            RuntimeAgentInvoker::new(runtime_with(r#"throw "no score""#).await, "workflow");

        let error = invoker.invoke(invocation(Some("scorer"))).await.expect_err("failure");
        assert!(matches!(error, AgentInvocationError::ExecutionFailed { ref status, .. } if status == "failed"));

        let missing = invoker.invoke(invocation(None)).await.expect_err("no agent id");
        assert!(matches!(missing, AgentInvocationError::MissingAgentId));
    }
}
