//! 提示词模板提供者与用户画像
//!
//! 模板按名字解析：优先读 config/prompts/{name}.txt，否则用内置默认值；变量以
//! `{nome}` 占位符替换，缺失变量保留原样。画像字段全部可选，缺省时使用文档化的
//! 回退字符串。

use serde::{Deserialize, Serialize};

/// 用户画像：个性化 system prompt 的输入（由调用方持有，核心不持久化）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: Option<String>,
    pub company_name: Option<String>,
    pub user_role: Option<String>,
    pub user_function: Option<String>,
    pub communication_tone: Option<String>,
    pub additional_guidelines: Option<String>,
}

/// 模板库：名字 -> 文本；render 做 {var} 替换
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary;

impl PromptLibrary {
    pub fn new() -> Self {
        Self
    }

    /// 渲染命名模板：文件覆盖优先，变量逐个替换
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> String {
        let template = [
            format!("config/prompts/{}.txt", name),
            format!("../config/prompts/{}.txt", name),
        ]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| default_template(name));

        vars.iter().fold(template, |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
    }

    /// 个性化 system prompt：画像缺省字段使用回退值
    pub fn system_prompt(&self, profile: Option<&UserProfile>) -> String {
        let empty = UserProfile::default();
        let p = profile.unwrap_or(&empty);
        if profile.is_none() {
            tracing::debug!("No user profile provided, using defaults");
        }
        self.render(
            "system",
            &[
                ("username", p.username.as_deref().unwrap_or("Usuário")),
                ("company_name", p.company_name.as_deref().unwrap_or("Sua empresa")),
                ("user_role", p.user_role.as_deref().unwrap_or("Profissional")),
                (
                    "user_function",
                    p.user_function.as_deref().unwrap_or("Cargo não especificado"),
                ),
                (
                    "communication_tone",
                    p.communication_tone.as_deref().unwrap_or(""),
                ),
                (
                    "additional_guidelines",
                    p.additional_guidelines.as_deref().unwrap_or(""),
                ),
            ],
        )
    }
}

/// 内置默认模板（config/prompts 下无同名文件时使用）
fn default_template(name: &str) -> String {
    match name {
        "system" => "\
Você é Edith, uma consultora de negócios experiente e conversacional.

Usuário: {username} ({user_role} - {user_function})
Empresa: {company_name}

Seja direta, prática e natural. Responda como uma consultora em conversa entre \
profissionais, não como um relatório formal.
{communication_tone}
{additional_guidelines}"
            .to_string(),

        "generate" => "\
{system_prompt}

Contexto da conversa: {context}

Pergunta do usuário: {user_input}

Responda como uma consultora experiente em uma conversa natural. Seja direta, \
prática e conversacional - não escreva um relatório formal. Se for algo \
complexo, organize suas ideias mas mantenha o tom de conversa entre \
profissionais."
            .to_string(),

        "reflection" => "\
Você é uma consultora senior revisando uma conversa. Avalie se esta resposta está boa para um cliente:

PERGUNTA: {user_input}

RESPOSTA DADA:
{draft_response}

Analise rapidamente:
1. A resposta soa conversacional e natural?
2. Está completa mas não excessivamente formal?
3. É útil e prática para o usuário?
4. Mantém o tom de consultora experiente?

Se vê algo para melhorar (tom muito formal, falta clareza, muito técnico, etc.), \
mencione usando palavras como \"melhorar\", \"adicionar\", \"melhor\".
Se está boa assim, diga que está adequada.

Avaliação:"
            .to_string(),

        "revision" => "\
{system_prompt}

PERGUNTA: {user_input}

RESPOSTA ANTERIOR:
{draft_response}

FEEDBACK DA REVISÃO:
{reflection}

Agora melhore a resposta baseada no feedback, mantendo sempre o tom \
conversacional de consultora experiente. Não transforme em relatório - mantenha \
como uma conversa natural e prática.

RESPOSTA MELHORADA:"
            .to_string(),

        "router" => "\
Você é um roteador para uma consultora de negócios conversacional. Classifique consultas em:

**DIRECT** - Para conversas normais (MAIORIA dos casos):
- Cumprimentos e apresentações
- Perguntas diretas sobre conceitos
- Pedidos de explicação ou esclarecimento
- Recomendações simples
- Dúvidas pontuais sobre estratégia/gestão
- Qualquer conversa que pode ser respondida naturalmente

**REACT** - APENAS para análises muito complexas e estruturadas:
- Desenvolvimento completo de business cases
- Análises competitivas detalhadas usando frameworks específicos
- Planejamento completo de entrada em mercado
- Reestruturação organizacional complexa
- Roadmaps de transformação digital completos

PREFIRA SEMPRE \"DIRECT\" - só use \"REACT\" para análises muito elaboradas que \
realmente precisam de múltiplas etapas estruturadas.

Responda APENAS com \"DIRECT\" ou \"REACT\"."
            .to_string(),

        "summarize" => "\
Resuma progressivamente a conversa abaixo, incorporando as novas mensagens ao \
resumo existente. Mantenha fatos, decisões e preferências do usuário.

RESUMO ATUAL:
{summary}

NOVAS MENSAGENS:
{new_lines}

NOVO RESUMO:"
            .to_string(),

        _ => String::new(),
    }
}
