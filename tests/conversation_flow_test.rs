//! 对话流集成测试

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use edith::chatbot::{ChatRequest, Chatbot};
    use edith::config::AppConfig;
    use edith::lifecycle::MessageLifecycle;
    use edith::llm::LlmClient;
    use edith::memory::Message;
    use edith::prompts::UserProfile;
    use edith::store::{
        ChatStore, ConversationEntry, EntryRole, EntryStatus, MemoryChatStore,
    };

    struct ScriptedLlm {
        responses: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&'static str>) -> Self {
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(i) {
                Some(r) => Ok(r.to_string()),
                None => Err("script exhausted".to_string()),
            }
        }
    }

    fn build_chatbot(store: Arc<MemoryChatStore>, responses: Vec<&'static str>) -> Chatbot {
        let llm = Arc::new(ScriptedLlm::new(responses));
        Chatbot::with_clients(AppConfig::default(), store, llm.clone(), llm)
    }

    #[tokio::test]
    async fn test_full_direct_then_react_conversation() {
        let store = Arc::new(MemoryChatStore::new());
        let bot = build_chatbot(
            store.clone(),
            vec![
                // 第一轮 direct
                "Olá! Eu sou a Edith, consultora de negócios.",
                // 第二轮 react：草稿、批评（触发修订）、修订稿
                "Rascunho da análise competitiva.",
                "Falta profundidade, você pode improve a estrutura.",
                "Análise competitiva revisada e aprofundada.",
            ],
        );

        let profile = UserProfile {
            username: Some("Ana".into()),
            company_name: Some("Acme".into()),
            ..Default::default()
        };

        let first = bot
            .chat(
                ChatRequest {
                    message: "Olá! Você pode se apresentar?".into(),
                    user_profile: Some(profile.clone()),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap();
        assert_eq!(first.metadata["routing_info"]["route"], "direct");

        let second = bot
            .chat(
                ChatRequest {
                    message: "Desenvolva uma estratégia de transformação digital completa".into(),
                    session_id: Some(first.session_id.clone()),
                    user_profile: Some(profile),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap();
        assert_eq!(second.metadata["routing_info"]["route"], "react");
        assert_eq!(second.metadata["step_count"], 2);
        assert_eq!(
            second.message,
            "Análise competitiva revisada e aprofundada."
        );

        // 同一会话里 4 条记录：user/assistant 交替，react 的助手条目带 6 步轨迹
        let history = bot
            .conversation_history(&first.session_id, "user_1")
            .await
            .unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, EntryRole::User);
        assert!(history[1].reflection_steps.is_none());
        assert_eq!(history[3].reflection_steps.as_ref().unwrap().len(), 6);

        let sessions = bot.user_sessions("user_1").await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_background_processing_reaches_terminal_state() {
        use tokio::time::{sleep, Duration};

        let store = Arc::new(MemoryChatStore::new());
        let bot = build_chatbot(store.clone(), vec!["Primeira resposta."]);

        let first = bot
            .chat(
                ChatRequest {
                    message: "Olá!".into(),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap();

        // 前端模式：先插入一条 pending 的空助手条目，再请求后台处理
        let placeholder = ConversationEntry::new(
            &first.session_id,
            "user_1",
            EntryRole::Assistant,
            "",
        )
        .with_status(EntryStatus::Pending);
        let message_id = store.insert_entry(placeholder).await.unwrap();

        let (lifecycle, _events) = MessageLifecycle::new(
            &AppConfig::default(),
            store.clone(),
            Arc::new(ScriptedLlm::new(vec!["Resposta em segundo plano."])),
        );

        let started = lifecycle
            .start(&message_id, "user_1", None, None)
            .await
            .unwrap();
        assert_eq!(started.status, "processing");
        assert_eq!(started.session_id, first.session_id);

        // 轮询直到终态
        let mut last_status = EntryStatus::Processing;
        for _ in 0..50 {
            let entry = store
                .get_entry(&message_id, "user_1")
                .await
                .unwrap()
                .unwrap();
            last_status = entry.status;
            if last_status.is_terminal() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(last_status, EntryStatus::Complete);
        let entry = store
            .get_entry(&message_id, "user_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content, "Resposta em segundo plano.");
    }
}
