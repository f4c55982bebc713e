//! 查询复杂度路由
//!
//! 先按显式规则表匹配（direct 优先于 react），两边都不命中时用一次低温 LLM 调用
//! 兜底。分类失败偏向便宜路径：任何异常或无法识别的回答都落回 direct，错误绝不
//! 外泄。规则表在构造时传入（不可变），保证分类可确定、可单测。

use std::sync::Arc;

use regex::Regex;
use serde_json::json;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::prompts::PromptLibrary;

/// 路由结果：直接回答或反思推理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRoute {
    Direct,
    React,
}

impl QueryRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryRoute::Direct => "direct",
            QueryRoute::React => "react",
        }
    }
}

const DIRECT_EXPLANATION: &str = "Pergunta simples - resposta direta e conversacional";
const REACT_EXPLANATION: &str =
    "Pergunta complexa - usando análise estruturada com múltiplas etapas";

/// 一次路由决策（不单独持久化，作为观测数据挂到轮次元数据上）
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub route: QueryRoute,
    pub explanation: String,
}

impl RoutingDecision {
    fn direct() -> Self {
        Self {
            route: QueryRoute::Direct,
            explanation: DIRECT_EXPLANATION.to_string(),
        }
    }

    fn react() -> Self {
        Self {
            route: QueryRoute::React,
            explanation: REACT_EXPLANATION.to_string(),
        }
    }

    /// 观测用 routing_info（user_input 超过 100 字符时截断）
    pub fn routing_info(&self, user_input: &str) -> serde_json::Value {
        let preview = if user_input.chars().count() > 100 {
            format!("{}...", user_input.chars().take(100).collect::<String>())
        } else {
            user_input.to_string()
        };
        json!({
            "route": self.route.as_str(),
            "explanation": self.explanation,
            "user_input": preview,
        })
    }
}

/// 有序、不可变的路由规则表；direct 规则先于 react 规则求值
pub struct RouterRules {
    direct: Vec<Regex>,
    react: Vec<Regex>,
}

impl RouterRules {
    pub fn new(direct: Vec<Regex>, react: Vec<Regex>) -> Self {
        Self { direct, react }
    }
}

impl Default for RouterRules {
    fn default() -> Self {
        // 会话型触发词：命中即走 direct
        let direct = [
            r"\b(olá|oi|hello|hi)\b",
            r"\bse apresent\w*",
            r"\b(obrigad\w*|thank\w*)\b",
            r"\b(como vai|how are you)\b",
            r"\b(quem é você|who are you)\b",
            r"\b(o que é|what is)\b",
            r"\b(como funciona|how does)\b",
            r"\b(explica|explain|me conta|tell me)\b",
            r"\b(ajuda|help|ajudar)\b.*\b(com|with)\b",
            r"\b(qual|which|que)\b.*\b(melhor|better|recomenda\w*|recommend)\b",
        ];
        // 仅完整的多步分析才走 react
        let react = [
            r"\b(analis\w*|analyz\w*)\b.*\b(competitiv\w*|concorr\w*|mercado completo|market analysis)\b",
            r"\b(desenvolv\w*|criar|create)\b.*\b(estratégia completa|plano detalhado|business case)\b",
            r"\b(swot completa|porter|canvas)\b.*\b(anális\w*|framework)\b",
            r"\b(defin\w*|estabelec\w*)\b.*\b(kpi\w*|métrica\w*)\b.*\b(completo\w*|sistema\w*)\b",
            r"\b(otimiz\w*|reestrutur\w*)\b.*\b(processo\w* completo|operação inteira)\b",
            r"\b(avali\w*|identif\w*)\b.*\b(risco\w* completo|análise de risco)\b",
            r"\b(roadmap|roteiro)\b.*\b(implementação|transformação digital)\b",
            r"\b(plano\w*|estratégia)\b.*\b(entrada.*mercado|expansão|transformação)\b",
        ];

        Self {
            direct: direct.iter().map(|p| Regex::new(p).unwrap()).collect(),
            react: react.iter().map(|p| Regex::new(p).unwrap()).collect(),
        }
    }
}

/// 查询路由器：规则表 + LLM 兜底
pub struct QueryRouter {
    llm: Arc<dyn LlmClient>,
    prompts: PromptLibrary,
    rules: RouterRules,
}

impl QueryRouter {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: PromptLibrary, rules: RouterRules) -> Self {
        Self { llm, prompts, rules }
    }

    /// 分类一条用户发言；recent_context 仅供 LLM 兜底参考
    pub async fn classify(&self, utterance: &str, recent_context: &str) -> RoutingDecision {
        let text = utterance.to_lowercase();
        let text = text.trim();

        for pattern in &self.rules.direct {
            if pattern.is_match(text) {
                return RoutingDecision::direct();
            }
        }

        for pattern in &self.rules.react {
            if pattern.is_match(text) {
                return RoutingDecision::react();
            }
        }

        match self.llm_route(utterance, recent_context).await {
            QueryRoute::React => RoutingDecision::react(),
            QueryRoute::Direct => RoutingDecision::direct(),
        }
    }

    /// LLM 兜底：回答必须是 DIRECT 或 REACT；其余一律 direct
    async fn llm_route(&self, utterance: &str, recent_context: &str) -> QueryRoute {
        let system = self.prompts.render("router", &[]);
        let user = format!(
            "Contexto da conversa: {}\n\nNova pergunta do usuário: {}\n\nClassificação:",
            recent_context, utterance
        );

        match self
            .llm
            .complete(&[Message::system(system), Message::user(user)])
            .await
        {
            Ok(decision) => {
                if decision.to_lowercase().contains("react") {
                    QueryRoute::React
                } else {
                    QueryRoute::Direct
                }
            }
            Err(e) => {
                tracing::warn!("Router LLM error: {}, defaulting to direct", e);
                QueryRoute::Direct
            }
        }
    }
}
