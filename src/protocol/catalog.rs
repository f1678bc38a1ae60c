//! The fixed Gearman command catalog.

use super::command::{Argument, CommandType};

use Argument::*;

const NONE: &[Argument] = &[];
const FUNCTION: &[Argument] = &[FunctionName];
const SUBMISSION: &[Argument] = &[FunctionName, UniqueId, Data];
const HANDLE: &[Argument] = &[JobHandle];
const HANDLE_DATA: &[Argument] = &[JobHandle, Data];
const ONLY_DATA: &[Argument] = &[Data];
const OPTION: &[Argument] = &[OptionName];

pub static CAN_DO: CommandType = CommandType::new("CAN_DO", 1, FUNCTION);
pub static CANT_DO: CommandType = CommandType::new("CANT_DO", 2, FUNCTION);
pub static RESET_ABILITIES: CommandType = CommandType::new("RESET_ABILITIES", 3, NONE);
pub static PRE_SLEEP: CommandType = CommandType::new("PRE_SLEEP", 4, NONE);
pub static NOOP: CommandType = CommandType::new("NOOP", 6, NONE);
pub static SUBMIT_JOB: CommandType = CommandType::new("SUBMIT_JOB", 7, SUBMISSION);
pub static JOB_CREATED: CommandType = CommandType::new("JOB_CREATED", 8, HANDLE);
pub static GRAB_JOB: CommandType = CommandType::new("GRAB_JOB", 9, NONE);
pub static NO_JOB: CommandType = CommandType::new("NO_JOB", 10, NONE);
pub static JOB_ASSIGN: CommandType =
    CommandType::new("JOB_ASSIGN", 11, &[JobHandle, FunctionName, Data]);
pub static WORK_STATUS: CommandType =
    CommandType::new("WORK_STATUS", 12, &[JobHandle, Numerator, Denominator]);
pub static WORK_COMPLETE: CommandType = CommandType::new("WORK_COMPLETE", 13, HANDLE_DATA);
pub static WORK_FAIL: CommandType = CommandType::new("WORK_FAIL", 14, HANDLE);
pub static GET_STATUS: CommandType = CommandType::new("GET_STATUS", 15, HANDLE);
pub static ECHO_REQ: CommandType = CommandType::new("ECHO_REQ", 16, ONLY_DATA);
pub static ECHO_RES: CommandType = CommandType::new("ECHO_RES", 17, ONLY_DATA);
pub static SUBMIT_JOB_BG: CommandType = CommandType::new("SUBMIT_JOB_BG", 18, SUBMISSION);
pub static ERROR: CommandType = CommandType::new("ERROR", 19, &[Code, Message]);
pub static STATUS_RES: CommandType = CommandType::new(
    "STATUS_RES",
    20,
    &[JobHandle, Status, RunningStatus, Numerator, Denominator],
);
pub static SUBMIT_JOB_HIGH: CommandType = CommandType::new("SUBMIT_JOB_HIGH", 21, SUBMISSION);
pub static SET_CLIENT_ID: CommandType = CommandType::new("SET_CLIENT_ID", 22, &[WorkerId]);
pub static CAN_DO_TIMEOUT: CommandType =
    CommandType::new("CAN_DO_TIMEOUT", 23, &[FunctionName, Timeout]);
pub static WORK_EXCEPTION: CommandType = CommandType::new("WORK_EXCEPTION", 25, HANDLE_DATA);
pub static OPTION_REQ: CommandType = CommandType::new("OPTION_REQ", 26, OPTION);
pub static OPTION_RES: CommandType = CommandType::new("OPTION_RES", 27, OPTION);
pub static WORK_DATA: CommandType = CommandType::new("WORK_DATA", 28, HANDLE_DATA);
pub static WORK_WARNING: CommandType = CommandType::new("WORK_WARNING", 29, HANDLE_DATA);
pub static GRAB_JOB_UNIQ: CommandType = CommandType::new("GRAB_JOB_UNIQ", 30, NONE);
pub static JOB_ASSIGN_UNIQ: CommandType = CommandType::new(
    "JOB_ASSIGN_UNIQ",
    31,
    &[JobHandle, FunctionName, UniqueId, Data],
);
pub static SUBMIT_JOB_HIGH_BG: CommandType =
    CommandType::new("SUBMIT_JOB_HIGH_BG", 32, SUBMISSION);
pub static SUBMIT_JOB_LOW: CommandType = CommandType::new("SUBMIT_JOB_LOW", 33, SUBMISSION);
pub static SUBMIT_JOB_LOW_BG: CommandType = CommandType::new("SUBMIT_JOB_LOW_BG", 34, SUBMISSION);

/// Every command type of the catalog.
pub static ALL: [&CommandType; 32] = [
    &CAN_DO,
    &CANT_DO,
    &RESET_ABILITIES,
    &PRE_SLEEP,
    &NOOP,
    &SUBMIT_JOB,
    &JOB_CREATED,
    &GRAB_JOB,
    &NO_JOB,
    &JOB_ASSIGN,
    &WORK_STATUS,
    &WORK_COMPLETE,
    &WORK_FAIL,
    &GET_STATUS,
    &ECHO_REQ,
    &ECHO_RES,
    &SUBMIT_JOB_BG,
    &ERROR,
    &STATUS_RES,
    &SUBMIT_JOB_HIGH,
    &SET_CLIENT_ID,
    &CAN_DO_TIMEOUT,
    &WORK_EXCEPTION,
    &OPTION_REQ,
    &OPTION_RES,
    &WORK_DATA,
    &WORK_WARNING,
    &GRAB_JOB_UNIQ,
    &JOB_ASSIGN_UNIQ,
    &SUBMIT_JOB_HIGH_BG,
    &SUBMIT_JOB_LOW,
    &SUBMIT_JOB_LOW_BG,
];
