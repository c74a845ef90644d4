//! 就诊会话状态机
//!
//! 管理患者一次就诊从采集、分析到确认归档的状态转换

use acne_core::{AcneError, Result, SessionState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 会话状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    PatientAllocated,
    ImageSubmitted,
    ImageRemoved,
    LastImageRemoved,
    AnalysisCompleted,
    Finalized,
}

/// 会话状态机
#[derive(Debug)]
pub struct SessionStateMachine {
    transitions: HashMap<(SessionState, SessionEvent), SessionState>,
}

impl SessionStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        use SessionEvent as E;
        use SessionState as S;

        let mut transitions = HashMap::new();

        transitions.insert((S::Created, E::PatientAllocated), S::Intake);

        transitions.insert((S::Intake, E::ImageSubmitted), S::ReadyToAnalyze);
        // 没有图像也允许分析，结果为 0 分
        transitions.insert((S::Intake, E::AnalysisCompleted), S::Analyzed);

        transitions.insert((S::ReadyToAnalyze, E::ImageSubmitted), S::ReadyToAnalyze);
        transitions.insert((S::ReadyToAnalyze, E::ImageRemoved), S::ReadyToAnalyze);
        transitions.insert((S::ReadyToAnalyze, E::LastImageRemoved), S::Intake);
        transitions.insert((S::ReadyToAnalyze, E::AnalysisCompleted), S::Analyzed);

        // 图像变化使已有结果失效
        transitions.insert((S::Analyzed, E::AnalysisCompleted), S::Analyzed);
        transitions.insert((S::Analyzed, E::ImageSubmitted), S::ReadyToAnalyze);
        transitions.insert((S::Analyzed, E::ImageRemoved), S::ReadyToAnalyze);
        transitions.insert((S::Analyzed, E::LastImageRemoved), S::Intake);
        transitions.insert((S::Analyzed, E::Finalized), S::Finalized);

        // 复诊重新评分
        transitions.insert((S::Finalized, E::ImageSubmitted), S::ReadyToAnalyze);
        transitions.insert((S::Finalized, E::ImageRemoved), S::ReadyToAnalyze);
        transitions.insert((S::Finalized, E::LastImageRemoved), S::Intake);
        transitions.insert((S::Finalized, E::AnalysisCompleted), S::Analyzed);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: SessionState, event: SessionEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: SessionState, event: SessionEvent) -> Result<SessionState> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(AcneError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current_state: SessionState) -> Vec<SessionEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current_state)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
